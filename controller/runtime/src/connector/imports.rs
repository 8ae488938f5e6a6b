use super::resource_id;
use crate::{
    broker::Broker,
    core::{ClusterInfo, ClusterKey, ResourceId},
    events::{Message, ServiceExportEvent, Topic},
    index::ServiceInfo,
    k8s::{
        self,
        service_import::{Endpoint, ServicePort, Target},
        ObjectMeta, Patch, PatchParams, PostParams, ServiceImport, ServiceImportSpec,
    },
    lease::Leadership,
    status::{self, conditions},
};
use anyhow::Result;
use futures::future;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const CONFLICT_RETRIES: usize = 3;

/// Applies the cluster set's decisions to one peer cluster.
pub(super) struct Importer {
    pub(super) info: ClusterInfo,
    pub(super) client: k8s::Client,
    pub(super) status: mpsc::Sender<status::Update>,
    pub(super) leadership: Leadership,
    /// Whether the peer is managed by a control plane.
    pub(super) managed: watch::Receiver<bool>,
}

/// What a peer does with a message.
#[derive(Debug, PartialEq)]
enum Action {
    /// Report the cluster set's verdict on the peer's own export.
    Report(Vec<k8s::Condition>),
    /// Import the export's endpoints.
    Import,
    /// Remove the export's endpoints.
    Strip,
    Ignore,
}

impl Importer {
    pub(super) async fn run(self, broker: Broker, shutdown: drain::Watch) {
        let subs = [
            Topic::ServiceExportCreated,
            Topic::ServiceExportDeleted,
            Topic::ServiceExportAccepted,
            Topic::ServiceExportRejected,
        ]
        .map(|topic| broker.subscribe(topic));
        let [mut created, mut deleted, mut accepted, mut rejected] = subs;

        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);
        loop {
            let message = tokio::select! {
                _ = &mut shutdown => break,
                m = created.recv() => m,
                m = deleted.recv() => m,
                m = accepted.recv() => m,
                m = rejected.recv() => m,
            };
            let Some(message) = message else {
                break;
            };
            self.handle(&message).await;
        }

        for sub in [created, deleted, accepted, rejected] {
            broker.unsubscribe(sub);
        }
    }

    async fn handle(&self, message: &Message) {
        let event = &message.event;
        let action = self.action(message);
        debug!(topic = %message.topic, origin = %event.geo.key, export = %event.export_id(), ?action);
        if !matches!(action, Action::Report(_)) && !self.leadership.is_leader() {
            return;
        }

        let result = match action {
            Action::Report(conditions) => {
                self.report(event, conditions).await;
                Ok(())
            }
            Action::Import => self.import(event).await,
            Action::Strip => self.strip(&event.export_id(), &event.geo.key).await,
            Action::Ignore => Ok(()),
        };
        if let Err(error) = result {
            warn!(
                topic = %message.topic,
                origin = %event.geo.key,
                export = %event.export_id(),
                %error,
                "Failed to update ServiceImport"
            );
        }
    }

    fn action(&self, message: &Message) -> Action {
        let event = &message.event;
        let own = event.geo.key == self.info.key;
        let id = event.export_id();
        match message.topic {
            Topic::ServiceExportAccepted if own => Action::Report(vec![
                conditions::valid(&id, Ok(()), event.export.metadata.generation),
                conditions::conflict(Ok(()), event.export.metadata.generation),
            ]),
            Topic::ServiceExportRejected if own => Action::Report(vec![conditions::conflict(
                Err(event.error.clone().unwrap_or_default()),
                event.export.metadata.generation,
            )]),
            _ if own => Action::Ignore,
            Topic::ServiceExportAccepted => {
                if *self.managed.borrow() && event.export.spec.targets(&self.info.key) {
                    Action::Import
                } else {
                    Action::Strip
                }
            }
            Topic::ServiceExportRejected | Topic::ServiceExportDeleted => Action::Strip,
            Topic::ServiceExportCreated if event.export.is_invalid() => Action::Strip,
            Topic::ServiceExportCreated => Action::Ignore,
        }
    }

    async fn report(&self, event: &ServiceExportEvent, conditions: Vec<k8s::Condition>) {
        let Some(patch) = status::export_patch(&event.export, conditions) else {
            return;
        };
        let update = status::Update {
            client: self.client.clone(),
            target: status::Target::ServiceExport(event.export_id()),
            patch,
        };
        if self.status.send(update).await.is_err() {
            warn!("Status controller has stopped");
        }
    }

    async fn import(&self, event: &ServiceExportEvent) -> Result<()> {
        let id = event.export_id();
        let Some(service) = event.service.as_ref() else {
            debug!(export = %id, "Exported service is unknown");
            return Ok(());
        };
        let ports = import_ports(event, service);
        let api = k8s::Api::<ServiceImport>::namespaced(self.client.clone(), &id.namespace);

        let mut attempt = 0;
        let import = loop {
            attempt += 1;
            let result = match api.get_opt(&id.name).await? {
                Some(mut import) => {
                    import.spec.merge_cluster(&event.geo.key, ports.clone());
                    api.replace(&id.name, &PostParams::default(), &import).await
                }
                None => {
                    let mut spec = ServiceImportSpec {
                        service_account_name: event.export.spec.service_account_name.clone(),
                        ..Default::default()
                    };
                    spec.merge_cluster(&event.geo.key, ports.clone());
                    let import = ServiceImport {
                        metadata: ObjectMeta {
                            namespace: Some(id.namespace.clone()),
                            name: Some(id.name.clone()),
                            ..Default::default()
                        },
                        spec,
                        status: None,
                    };
                    api.create(&PostParams::default(), &import).await
                }
            };
            match result {
                Ok(import) => break import,
                Err(k8s::Error::Api(e)) if e.code == 409 && attempt < CONFLICT_RETRIES => {
                    debug!(export = %id, "ServiceImport changed concurrently; retrying");
                }
                Err(error) => return Err(error.into()),
            }
        };
        info!(cluster = %self.info.key, import = %id, origin = %event.geo.key, "Imported");
        self.patch_status(&api, &import).await
    }

    async fn strip(&self, id: &ResourceId, origin: &ClusterKey) -> Result<()> {
        let api = k8s::Api::<ServiceImport>::namespaced(self.client.clone(), &id.namespace);
        let Some(import) = api.get_opt(&id.name).await? else {
            return Ok(());
        };
        strip_import(&api, import, origin).await
    }

    async fn patch_status(
        &self,
        api: &k8s::Api<ServiceImport>,
        import: &ServiceImport,
    ) -> Result<()> {
        let patch = Patch::Merge(serde_json::json!({
            "status": import.cluster_status(),
        }));
        api.patch_status(
            &import.metadata.name.clone().unwrap_or_default(),
            &PatchParams::default(),
            &patch,
        )
        .await?;
        Ok(())
    }
}

/// Removes `origin`'s endpoints from `import`, deleting the import once no
/// cluster contributes to it.
async fn strip_import(
    api: &k8s::Api<ServiceImport>,
    mut import: ServiceImport,
    origin: &ClusterKey,
) -> Result<()> {
    let id = resource_id(&import);
    if !import.spec.remove_cluster(origin) {
        return Ok(());
    }
    if import.spec.is_empty() {
        match api.delete(&id.name, &Default::default()).await {
            Ok(_) => {}
            Err(k8s::Error::Api(e)) if e.code == 404 => {}
            Err(error) => return Err(error.into()),
        }
        info!(import = %id, %origin, "Deleted empty ServiceImport");
        return Ok(());
    }
    api.replace(&id.name, &PostParams::default(), &import).await?;
    info!(import = %id, %origin, "Removed endpoints");
    Ok(())
}

/// Removes `cluster`'s endpoints from every ServiceImport visible to
/// `client`.
pub(super) async fn remove_cluster(client: &k8s::Client, cluster: &ClusterKey) -> Result<()> {
    let all = k8s::Api::<ServiceImport>::all(client.clone());
    let imports = all.list(&Default::default()).await?;
    let key = cluster.to_string();
    let results = future::join_all(
        imports
            .items
            .into_iter()
            .filter(|import| import.spec.clusters().contains(&key))
            .map(|import| {
                let api = k8s::Api::<ServiceImport>::namespaced(
                    client.clone(),
                    &import.metadata.namespace.clone().unwrap_or_default(),
                );
                async move { strip_import(&api, import, cluster).await }
            }),
    )
    .await;
    results.into_iter().collect()
}

/// The ports through which a peer reaches `event`'s export: each rule maps
/// to the service port of the same number, with one endpoint per rule
/// pointing at the origin's gateway.
fn import_ports(event: &ServiceExportEvent, service: &ServiceInfo) -> Vec<ServicePort> {
    let geo = &event.geo;
    let mut ports = BTreeMap::<u16, ServicePort>::new();
    for rule in &event.export.spec.rules {
        let number = rule.port_number.get();
        let Some(svc_port) = service.ports.iter().find(|p| p.port == i32::from(number)) else {
            continue;
        };
        let port = ports.entry(number).or_insert_with(|| ServicePort {
            name: svc_port.name.clone(),
            protocol: svc_port.protocol.clone(),
            app_protocol: svc_port.app_protocol.clone(),
            port: number,
            endpoints: vec![],
        });
        port.endpoints.push(Endpoint {
            cluster_key: geo.key.to_string(),
            target: Target {
                host: geo.gateway_host.clone(),
                ip: geo.gateway_ip.map(|ip| ip.to_string()).unwrap_or_default(),
                port: geo.gateway_port,
                path: rule.path.clone(),
            },
        });
    }
    ports.into_values().collect()
}
