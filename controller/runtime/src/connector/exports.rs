use super::local::MANAGED_INGRESS_PREFIX;
use crate::{
    core::{stable_hash, ResourceId, CONTROLLER_NAME},
    index::{
        ingress::{convert_path, LOAD_BALANCER, REWRITE_FROM, REWRITE_TO, SESSION_STICKY},
        ExportEvent, SharedExportIndex, SharedIndex,
    },
    k8s::{
        self, service_export::PathType, HTTPIngressPath, HTTPIngressRuleValue, Ingress,
        IngressBackend, IngressRule, IngressServiceBackend, IngressSpec, ObjectMeta, Patch,
        PatchParams, Resource, ServiceBackendPort, ServiceExport,
    },
    lease::Leadership,
    status::{self, conditions},
};
use anyhow::{Context as _, Result};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub(crate) const EXPORT_HASH_ANNOTATION: &str = "multicluster.flomesh.io/export-hash";

/// Validates the home cluster's ServiceExports and maintains the Ingress
/// that routes each valid export through the gateway.
pub(super) struct Validator {
    pub(super) client: k8s::Client,
    pub(super) index: SharedIndex,
    pub(super) exports: SharedExportIndex,
    pub(super) status: mpsc::Sender<status::Update>,
    pub(super) leadership: Leadership,
    pub(super) ingress_class: String,
}

impl Validator {
    pub(super) async fn run(self, mut events: mpsc::UnboundedReceiver<ExportEvent>) {
        while let Some(event) = events.recv().await {
            if let ExportEvent::Revalidate(id) = event {
                self.revalidate(&id).await;
            }
        }
    }

    async fn revalidate(&self, id: &ResourceId) {
        let Some(export) = self.exports.read().export(id).cloned() else {
            debug!(export = %id, "Export no longer exists");
            return;
        };

        let result = self.validate(id, &export);
        match &result {
            Ok(()) => debug!(export = %id, "Valid"),
            Err(message) => info!(export = %id, %message, "Invalid"),
        }
        let condition = conditions::valid(id, result.clone(), export.metadata.generation);
        if let Some(patch) = status::export_patch(&export, [condition]) {
            let update = status::Update {
                client: self.client.clone(),
                target: status::Target::ServiceExport(id.clone()),
                patch,
            };
            if self.status.send(update).await.is_err() {
                warn!("Status controller has stopped");
            }
        }

        if !self.leadership.is_leader() {
            return;
        }
        let applied = match result {
            Ok(()) => self.apply_ingress(&export).await,
            Err(_) => self.delete_ingress(id).await,
        };
        if let Err(error) = applied {
            warn!(export = %id, %error, "Failed to update the export's Ingress");
        }
    }

    fn validate(&self, id: &ResourceId, export: &ServiceExport) -> Result<(), String> {
        {
            let exports = self.exports.read();
            let service = exports
                .service(id)
                .ok_or_else(|| format!("Service {id} not found"))?;
            if service.deleting {
                return Err(format!("Service {id} is being deleted."));
            }
            if service.type_ == "ExternalName" {
                return Err(format!(
                    "Type of Service {id} is ExternalName, cannot be exported."
                ));
            }
            for rule in &export.spec.rules {
                let port = i32::from(rule.port_number.get());
                if !service.ports.iter().any(|p| p.port == port) {
                    return Err(format!("Service {id} has no port {port}"));
                }
            }
        }

        let managed = ResourceId::new(&id.namespace, ingress_name(&id.name));
        let index = self.index.read();
        for rule in &export.spec.rules {
            let Some(path) = convert_path(&rule.path, path_type(rule.path_type))
            else {
                continue;
            };
            if let Some(owner) = index.route_owners("", &path, &managed).next() {
                return Err(format!(
                    "The path {:?} has been defined in Ingress {owner}",
                    rule.path
                ));
            };
        }
        Ok(())
    }

    async fn apply_ingress(&self, export: &ServiceExport) -> Result<()> {
        let ingress = managed_ingress(export, &self.ingress_class)?;
        let namespace = ingress.metadata.namespace.clone().unwrap_or_default();
        let name = ingress.metadata.name.clone().unwrap_or_default();
        let api = k8s::Api::<Ingress>::namespaced(self.client.clone(), &namespace);

        let hash = export_hash(&ingress);
        if let Some(current) = api.get_opt(&name).await? {
            if export_hash(&current) == hash {
                return Ok(());
            }
        }
        api.patch(
            &name,
            &PatchParams::apply(CONTROLLER_NAME).force(),
            &Patch::Apply(ingress),
        )
        .await
        .with_context(|| format!("failed to apply Ingress {namespace}/{name}"))?;
        info!(ingress = %format_args!("{namespace}/{name}"), "Applied Ingress");
        Ok(())
    }

    async fn delete_ingress(&self, id: &ResourceId) -> Result<()> {
        let api = k8s::Api::<Ingress>::namespaced(self.client.clone(), &id.namespace);
        let name = ingress_name(&id.name);
        match api.delete(&name, &Default::default()).await {
            Ok(_) => {
                info!(ingress = %format_args!("{}/{name}", id.namespace), "Deleted Ingress");
                Ok(())
            }
            Err(k8s::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

pub(crate) fn ingress_name(export: &str) -> String {
    format!("{MANAGED_INGRESS_PREFIX}{export}")
}

fn path_type(pt: PathType) -> &'static str {
    match pt {
        PathType::Exact => "Exact",
        PathType::Prefix => "Prefix",
    }
}

fn export_hash(ingress: &Ingress) -> Option<&str> {
    ingress
        .metadata
        .annotations
        .as_ref()?
        .get(EXPORT_HASH_ANNOTATION)
        .map(String::as_str)
}

/// Builds the Ingress that exposes `export` through the gateway.
fn managed_ingress(export: &ServiceExport, class: &str) -> Result<Ingress> {
    let owner = export
        .controller_owner_ref(&())
        .context("ServiceExport has no name or uid")?;
    let namespace = export.metadata.namespace.clone().unwrap_or_default();
    let name = export.metadata.name.clone().unwrap_or_default();
    let spec = &export.spec;

    let mut annotations = BTreeMap::new();
    annotations.insert(EXPORT_HASH_ANNOTATION.to_string(), stable_hash(spec));
    if let Some(rewrite) = spec
        .path_rewrite
        .as_ref()
        .filter(|r| !r.from.is_empty() && !r.to.is_empty())
    {
        annotations.insert(REWRITE_FROM.to_string(), rewrite.from.clone());
        annotations.insert(REWRITE_TO.to_string(), rewrite.to.clone());
    }
    if spec.session_sticky {
        annotations.insert(SESSION_STICKY.to_string(), "true".to_string());
    }
    annotations.insert(
        LOAD_BALANCER.to_string(),
        spec.balancer().to_string(),
    );

    let paths = spec
        .rules
        .iter()
        .map(|rule| HTTPIngressPath {
            path: Some(rule.path.clone()),
            path_type: path_type(rule.path_type).to_string(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend {
                    name: name.clone(),
                    port: Some(ServiceBackendPort {
                        number: Some(i32::from(rule.port_number.get())),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            },
        })
        .collect();

    Ok(Ingress {
        metadata: ObjectMeta {
            name: Some(ingress_name(&name)),
            namespace: Some(namespace),
            annotations: Some(annotations),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(class.to_string()),
            rules: Some(vec![IngressRule {
                host: None,
                http: Some(HTTPIngressRuleValue { paths }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}
