use super::{imports::Importer, resource_id, Context, Settings};
use crate::{
    broker::Broker,
    core::ClusterInfo,
    events::{Message, ServiceExportEvent, Topic},
    index::{ExportEvent, SharedExportIndex},
    k8s::{
        self, mesh_config::MESH_CONFIG_KEY, ConfigMap, MeshConfig, Patch, PatchParams, Service,
        ServiceExport, ServiceImport,
    },
    lease::Leadership,
};
use anyhow::{bail, Context as _, Result};
use futures::prelude::*;
use kube::runtime::watcher;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, info_span, warn, Instrument};

/// The connector of a peer cluster.
pub(super) struct Remote {
    pub(super) ctx: Context,
    pub(super) info: ClusterInfo,
    pub(super) client: k8s::Client,
    pub(super) exports: SharedExportIndex,
}

impl Remote {
    pub(super) async fn run(
        self,
        events: mpsc::UnboundedReceiver<ExportEvent>,
        shutdown: drain::Watch,
    ) -> Result<()> {
        let settings = &self.ctx.settings;
        let mesh_api =
            k8s::Api::<ConfigMap>::namespaced(self.client.clone(), &settings.controller_namespace);
        let cm = mesh_api
            .get(&settings.mesh_config_name)
            .await
            .context("failed to get the peer's MeshConfig")?;
        let mesh = MeshConfig::from_config_map(&cm)?;
        let (managed_tx, managed_rx) = watch::channel(mesh.is_managed);

        let mut tasks = vec![tokio::spawn(
            watch_managed(mesh_api, settings.mesh_config_name.clone(), managed_tx)
                .instrument(info_span!("meshconfig")),
        )];

        tasks.push(self.watch::<Service, _>(self.exports.clone()));
        tasks.push(self.watch::<ServiceImport, _>(self.exports.clone()));
        tasks.push(self.watch::<ServiceExport, _>(self.exports.clone()));

        let importer = Importer {
            info: self.info.clone(),
            client: self.client.clone(),
            status: self.ctx.status.clone(),
            leadership: self.ctx.leadership.clone(),
            managed: managed_rx.clone(),
        };
        tasks.push(tokio::spawn(
            importer
                .run(self.ctx.broker.clone(), shutdown.clone())
                .instrument(info_span!("imports")),
        ));

        let forwarder = Forwarder {
            geo: self.info.clone(),
            exports: self.exports.clone(),
            broker: self.ctx.broker.clone(),
            managed: managed_rx,
        };
        tasks.push(tokio::spawn(
            forwarder.run(events).instrument(info_span!("exports")),
        ));

        info!(cluster = %self.info.key, "Connected");
        let release = shutdown.signaled().await;
        debug!(cluster = %self.info.key, "Stopping");
        for task in tasks {
            task.abort();
        }
        drop(release);
        Ok(())
    }

    fn watch<T, I>(&self, index: Arc<parking_lot::RwLock<I>>) -> JoinHandle<()>
    where
        T: k8s::Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
            + serde::de::DeserializeOwned
            + Clone
            + std::fmt::Debug
            + Send
            + Sync
            + 'static,
        I: kubert::index::IndexNamespacedResource<T> + Send + Sync + 'static,
    {
        let api = k8s::Api::<T>::all(self.client.clone());
        let span = info_span!("watch", kind = %T::kind(&()));
        let events = k8s::watch(api, watcher::Config::default(), span.clone());
        tokio::spawn(kubert::index::namespaced(index, events).instrument(span))
    }
}

/// Marks the peer as managed by this control plane.
///
/// Fails if another control plane already manages the peer.
pub(super) async fn join(
    client: &k8s::Client,
    settings: &Settings,
    info: &ClusterInfo,
    leadership: &Leadership,
) -> Result<()> {
    let api = k8s::Api::<ConfigMap>::namespaced(client.clone(), &settings.controller_namespace);
    let cm = api
        .get(&settings.mesh_config_name)
        .await
        .context("failed to get the peer's MeshConfig")?;
    let Some(data) = join_data(&cm, &info.control_plane_uid)? else {
        return Ok(());
    };
    if !leadership.is_leader() {
        return Ok(());
    }

    let patch = Patch::Merge(serde_json::json!({
        "data": { MESH_CONFIG_KEY: data },
    }));
    api.patch(&settings.mesh_config_name, &PatchParams::default(), &patch)
        .await
        .context("failed to update the peer's MeshConfig")?;
    info!(cluster = %info.key, "Joined the cluster set");
    Ok(())
}

/// The MeshConfig document marking the peer as managed by
/// `control_plane_uid`, or `None` if it already is.
fn join_data(cm: &ConfigMap, control_plane_uid: &str) -> Result<Option<String>> {
    let mesh = MeshConfig::from_config_map(cm)?;
    let current = &mesh.cluster.control_plane_uid;
    if mesh.is_managed && current == control_plane_uid {
        return Ok(None);
    }
    if mesh.is_managed && !current.is_empty() {
        bail!("cluster is already managed by control plane {current}");
    }

    // Edit the raw document so that fields unknown to this controller are
    // preserved.
    let raw = cm
        .data
        .as_ref()
        .and_then(|d| d.get(MESH_CONFIG_KEY))
        .context("MeshConfig is empty")?;
    let mut doc = serde_json::from_str::<serde_json::Value>(raw)?;
    doc["isManaged"] = true.into();
    doc["cluster"]["controlPlaneUID"] = control_plane_uid.into();
    Ok(Some(serde_json::to_string_pretty(&doc)?))
}

/// Tracks whether the peer is managed.
async fn watch_managed(api: k8s::Api<ConfigMap>, name: String, managed: watch::Sender<bool>) {
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
    let events = k8s::watch(api, config, tracing::Span::current());
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        let (watcher::Event::Apply(cm) | watcher::Event::InitApply(cm)) = event else {
            continue;
        };
        match MeshConfig::from_config_map(&cm) {
            Ok(mesh) => {
                managed.send_if_modified(|m| {
                    let changed = *m != mesh.is_managed;
                    *m = mesh.is_managed;
                    changed
                });
            }
            Err(error) => warn!(%error, "Ignoring invalid MeshConfig"),
        }
    }
}

/// Forwards the peer's export changes to the federation reconciler.
struct Forwarder {
    geo: ClusterInfo,
    exports: SharedExportIndex,
    broker: Broker,
    managed: watch::Receiver<bool>,
}

impl Forwarder {
    async fn run(self, mut events: mpsc::UnboundedReceiver<ExportEvent>) {
        while let Some(event) = events.recv().await {
            if let Some(message) = self.message(event) {
                self.broker.enqueue(message);
            }
        }
    }

    fn message(&self, event: ExportEvent) -> Option<Message> {
        let (topic, export) = match event {
            ExportEvent::Created(export) => (Topic::ServiceExportCreated, *export),
            ExportEvent::Deleted(export) => (Topic::ServiceExportDeleted, *export),
            ExportEvent::Revalidate(_) => return None,
        };
        let id = resource_id(&export);
        let service = self.exports.read().service(&id).cloned();

        if topic == Topic::ServiceExportCreated {
            if !*self.managed.borrow() {
                debug!(export = %id, "Cluster is not managed; ignoring export");
                return None;
            }
            match &service {
                None => {
                    debug!(export = %id, "Exported service not found");
                    return None;
                }
                Some(svc) if svc.type_ == "ExternalName" => {
                    debug!(export = %id, "ExternalName services cannot be exported");
                    return None;
                }
                Some(_) => {}
            }
        }

        Some(Message::new(
            topic,
            ServiceExportEvent {
                geo: self.geo.clone(),
                export,
                service,
                error: None,
            },
        ))
    }
}
