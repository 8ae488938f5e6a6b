use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use erie_canal_controller_core::ResourceId;
use erie_canal_controller_k8s_api::{
    service_export::CONDITION_VALID, ResourceExt, Service, ServiceExport, ServiceExportSpec,
    ServiceImport, ServicePort,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub type SharedExportIndex = Arc<RwLock<ExportIndex>>;

/// What a connector must act on as a member cluster's exports change.
#[derive(Clone, Debug)]
pub enum ExportEvent {
    /// An export's spec or validity changed.
    Created(Box<ServiceExport>),

    /// An export was removed.
    Deleted(Box<ServiceExport>),

    /// An export, or the service it exports, changed and must be validated
    /// again.
    Revalidate(ResourceId),
}

/// The subset of a service needed to validate and import its exports.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceInfo {
    pub type_: String,
    pub deleting: bool,
    pub ports: Vec<ServicePort>,
}

/// Indexes a member cluster's set membership: its ServiceExports, the
/// Services they export and the ServiceImports it holds.
#[derive(Debug)]
pub struct ExportIndex {
    exports: HashMap<ResourceId, ServiceExport>,
    signatures: HashMap<ResourceId, Signature>,
    services: HashMap<ResourceId, ServiceInfo>,
    imports: HashSet<ResourceId>,
    events: UnboundedSender<ExportEvent>,
}

/// The parts of an export that, when changed, require it to be adjudicated
/// again.
#[derive(Clone, Debug, PartialEq)]
struct Signature {
    spec: ServiceExportSpec,
    valid: Option<String>,
}

// === impl ExportIndex ===

impl ExportIndex {
    pub fn shared(events: UnboundedSender<ExportEvent>) -> SharedExportIndex {
        Arc::new(RwLock::new(Self {
            exports: HashMap::new(),
            signatures: HashMap::new(),
            services: HashMap::new(),
            imports: HashSet::new(),
            events,
        }))
    }

    pub fn export(&self, id: &ResourceId) -> Option<&ServiceExport> {
        self.exports.get(id)
    }

    pub fn exports(&self) -> impl Iterator<Item = (&ResourceId, &ServiceExport)> {
        self.exports.iter()
    }

    pub fn service(&self, id: &ResourceId) -> Option<&ServiceInfo> {
        self.services.get(id)
    }

    /// The export of `id` accepted by the cluster set, if any.
    pub fn accepted_export(&self, id: &ResourceId) -> Option<&ServiceExport> {
        self.exports.get(id).filter(|e| e.is_accepted())
    }

    /// True if `id` is already a member of the cluster set from this
    /// cluster's point of view: it imports the service or exports it with
    /// the cluster set's approval.
    pub fn service_import_exists(&self, id: &ResourceId) -> bool {
        self.imports.contains(id) || self.accepted_export(id).is_some()
    }

    fn send(&self, event: ExportEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Export events receiver dropped");
        }
    }
}

impl kubert::index::IndexNamespacedResource<ServiceExport> for ExportIndex {
    fn apply(&mut self, export: ServiceExport) {
        let id = ResourceId::new(export.namespace().unwrap_or_default(), export.name_unchecked());
        let signature = Signature {
            spec: export.spec.clone(),
            valid: export
                .status
                .iter()
                .flat_map(|s| s.conditions.iter())
                .find(|c| c.type_ == CONDITION_VALID)
                .map(|c| c.status.clone()),
        };

        let spec_changed = self
            .signatures
            .get(&id)
            .map(|s| s.spec != signature.spec)
            .unwrap_or(true);
        let changed = self.signatures.get(&id) != Some(&signature);
        self.signatures.insert(id.clone(), signature);
        self.exports.insert(id.clone(), export.clone());

        if spec_changed {
            self.send(ExportEvent::Revalidate(id));
        }
        if changed {
            self.send(ExportEvent::Created(Box::new(export)));
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        self.signatures.remove(&id);
        if let Some(export) = self.exports.remove(&id) {
            self.send(ExportEvent::Deleted(Box::new(export)));
        }
    }
}

impl kubert::index::IndexNamespacedResource<Service> for ExportIndex {
    fn apply(&mut self, service: Service) {
        let id = ResourceId::new(service.namespace().unwrap_or_default(), service.name_unchecked());
        let spec = service.spec.clone().unwrap_or_default();
        let info = ServiceInfo {
            type_: spec.type_.unwrap_or_else(|| "ClusterIP".to_string()),
            deleting: service.metadata.deletion_timestamp.is_some(),
            ports: spec.ports.unwrap_or_default(),
        };
        if self.services.insert(id.clone(), info.clone()).as_ref() != Some(&info)
            && self.exports.contains_key(&id)
        {
            self.send(ExportEvent::Revalidate(id));
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if self.services.remove(&id).is_some() && self.exports.contains_key(&id) {
            self.send(ExportEvent::Revalidate(id));
        }
    }
}

impl kubert::index::IndexNamespacedResource<ServiceImport> for ExportIndex {
    fn apply(&mut self, import: ServiceImport) {
        self.imports.insert(ResourceId::new(
            import.namespace().unwrap_or_default(),
            import.name_unchecked(),
        ));
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.imports.remove(&ResourceId::new(namespace, name));
    }
}
