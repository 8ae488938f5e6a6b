//! ErieCanal Kube View
//!
//! Indexes the resources of a member cluster that contribute to its routing
//! tables and compiles them into service and ingress snapshots:
//!
//! - Each `Service` contributes its ports. `ClusterIP` services are served by
//!   their `Endpoints`; `ExternalName` services by their external name.
//! - Each `ServiceImport` contributes the gateways of the peer clusters that
//!   export the service.
//! - Each `Ingress` of the controller's class contributes host/path routes to
//!   a service port. `IngressClass`es decide which unclassed Ingresses are
//!   ours.
//! - `Secret`s hold TLS material. They are looked up while compiling and never
//!   trigger compilation themselves.
//!
//! ```text
//! [ watch ] -> [ Index ] --fragments--> [ Trackers ] <-checkout- [ Compiler ] -> [ Snapshots ]
//! ```
//!
//! Watch handlers only derive per-object fragments and record them in the
//! change trackers. The [`Compiler`] applies the pending changes to its
//! canonical maps when it runs.
//!
//! The [`ExportIndex`] is maintained for every member cluster. It tracks the
//! cluster's ServiceExports and ServiceImports for adjudication.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod compiler;
mod endpoints;
pub mod exports;
pub mod ingress;
pub mod secrets;
mod service;
mod service_import;
mod sync;


pub use self::{
    compiler::{Compiled, Compiler, Options, PathCollision},
    exports::{ExportEvent, ExportIndex, ServiceInfo, SharedExportIndex},
    ingress::IngressClasses,
    secrets::{SecretLookup, Secrets, SharedSecrets},
    sync::{Resource, SyncBarrier},
};
use self::{
    endpoints::EndpointsFragment,
    ingress::{BackendPort, DeclaredRoute, IngressFragment},
    service::ServiceFragment,
    service_import::ImportFragment,
};
use ahash::AHashMap as HashMap;
use erie_canal_controller_core::{
    tracker::{ChangeTracker, Kind},
    ResourceId, INGRESS_CLASS,
};
use erie_canal_controller_k8s_api::{
    Endpoints, Ingress, IngressClass, ResourceExt, Service, ServiceImport,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Notify;

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Clone, Debug)]
pub struct Config {
    /// The ingress class served by the proxy.
    pub ingress_class: String,

    /// Secrets referenced without a namespace are looked up here.
    pub controller_namespace: String,
}

/// Pending fragment changes per resource type.
#[derive(Debug)]
pub struct Trackers {
    services: ChangeTracker<ResourceId, ServiceFragment>,
    endpoints: ChangeTracker<ResourceId, EndpointsFragment>,
    imports: ChangeTracker<ResourceId, ImportFragment>,
    ingresses: ChangeTracker<ResourceId, IngressFragment>,
}

/// Holds the last fragment derived from each object.
#[derive(Debug)]
pub struct Index {
    config: Config,
    trackers: Arc<Trackers>,
    changed: Arc<Notify>,

    services: HashMap<ResourceId, ServiceFragment>,
    endpoints: HashMap<ResourceId, EndpointsFragment>,
    imports: HashMap<ResourceId, ImportFragment>,

    /// All Ingresses, of any class, so that they can be re-evaluated when the
    /// default class changes.
    ingresses: HashMap<ResourceId, Ingress>,
    routes: HashMap<ResourceId, IngressFragment>,
    classes: IngressClasses,
}

// === impl Config ===

impl Config {
    pub fn new(controller_namespace: impl Into<String>) -> Self {
        Self {
            ingress_class: INGRESS_CLASS.to_string(),
            controller_namespace: controller_namespace.into(),
        }
    }
}

// === impl Trackers ===

impl Trackers {
    fn new() -> Self {
        Self {
            services: ChangeTracker::new(Kind::Service),
            endpoints: ChangeTracker::new(Kind::Endpoints),
            imports: ChangeTracker::new(Kind::ServiceImport),
            ingresses: ChangeTracker::new(Kind::Ingress),
        }
    }

    fn is_empty(&self) -> bool {
        self.services.is_empty()
            && self.endpoints.is_empty()
            && self.imports.is_empty()
            && self.ingresses.is_empty()
    }
}

// === impl Index ===

impl Index {
    /// Creates an index and the compiler that consumes its changes.
    ///
    /// `changed` is notified whenever a change is recorded.
    pub fn new(config: Config, changed: Arc<Notify>) -> (SharedIndex, Compiler) {
        let trackers = Arc::new(Trackers::new());
        let index = Self {
            config,
            trackers: trackers.clone(),
            changed,
            services: HashMap::new(),
            endpoints: HashMap::new(),
            imports: HashMap::new(),
            ingresses: HashMap::new(),
            routes: HashMap::new(),
            classes: IngressClasses::default(),
        };
        (Arc::new(RwLock::new(index)), Compiler::new(trackers))
    }

    /// The Ingresses, other than `except`, routing `host` and `path`.
    pub fn route_owners<'a>(
        &'a self,
        host: &'a str,
        path: &'a str,
        except: &'a ResourceId,
    ) -> impl Iterator<Item = &'a ResourceId> + 'a {
        self.routes
            .iter()
            .filter(move |(id, _)| *id != except)
            .filter(move |(_, routes)| {
                routes
                    .iter()
                    .any(|(k, r)| k.host_path() == (host, path) && self.resolves(r))
            })
            .map(|(id, _)| id)
    }

    /// Whether a route's backend names a known service port. Routes that do
    /// not resolve are never compiled, so they cannot own a path.
    fn resolves(&self, route: &DeclaredRoute) -> bool {
        let Some(ports) = self.services.get(&route.service) else {
            return false;
        };
        match &route.port {
            BackendPort::Name(name) => ports.keys().any(|spn| spn.port == *name),
            BackendPort::Number(number) => ports.values().any(|info| info.port == *number),
        }
    }

    fn record<V: Clone + PartialEq>(
        tracker: &ChangeTracker<ResourceId, V>,
        last: &mut HashMap<ResourceId, V>,
        changed: &Notify,
        id: ResourceId,
        current: Option<V>,
    ) {
        let previous = match current.as_ref() {
            Some(c) => last.insert(id.clone(), c.clone()),
            None => last.remove(&id),
        };
        if previous == current {
            return;
        }
        if tracker.update(id, previous, current) {
            changed.notify_one();
        }
    }

    fn reindex_ingress(&mut self, id: ResourceId) {
        let current = self.ingresses.get(&id).and_then(|ingress| {
            self.classes
                .accepts(ingress, &self.config.ingress_class)
                .then(|| ingress::fragment(ingress, &self.config.controller_namespace))
        });
        Self::record(
            &self.trackers.ingresses,
            &mut self.routes,
            &self.changed,
            id,
            current,
        );
    }

    fn reindex_ingresses(&mut self) {
        let ids = self.ingresses.keys().cloned().collect::<Vec<_>>();
        for id in ids {
            self.reindex_ingress(id);
        }
    }
}

fn resource_id<T: ResourceExt>(resource: &T) -> ResourceId {
    ResourceId::new(resource.namespace().unwrap_or_default(), resource.name_unchecked())
}

impl kubert::index::IndexNamespacedResource<Service> for Index {
    fn apply(&mut self, service: Service) {
        let current = service::fragment(&service);
        Self::record(
            &self.trackers.services,
            &mut self.services,
            &self.changed,
            resource_id(&service),
            current,
        );
    }

    fn delete(&mut self, namespace: String, name: String) {
        Self::record(
            &self.trackers.services,
            &mut self.services,
            &self.changed,
            ResourceId::new(namespace, name),
            None,
        );
    }
}

impl kubert::index::IndexNamespacedResource<Endpoints> for Index {
    fn apply(&mut self, endpoints: Endpoints) {
        let current = Some(endpoints::fragment(&endpoints));
        Self::record(
            &self.trackers.endpoints,
            &mut self.endpoints,
            &self.changed,
            resource_id(&endpoints),
            current,
        );
    }

    fn delete(&mut self, namespace: String, name: String) {
        Self::record(
            &self.trackers.endpoints,
            &mut self.endpoints,
            &self.changed,
            ResourceId::new(namespace, name),
            None,
        );
    }
}

impl kubert::index::IndexNamespacedResource<ServiceImport> for Index {
    fn apply(&mut self, import: ServiceImport) {
        let current = Some(service_import::fragment(&import));
        Self::record(
            &self.trackers.imports,
            &mut self.imports,
            &self.changed,
            resource_id(&import),
            current,
        );
    }

    fn delete(&mut self, namespace: String, name: String) {
        Self::record(
            &self.trackers.imports,
            &mut self.imports,
            &self.changed,
            ResourceId::new(namespace, name),
            None,
        );
    }
}

impl kubert::index::IndexNamespacedResource<Ingress> for Index {
    fn apply(&mut self, ingress: Ingress) {
        let id = resource_id(&ingress);
        self.ingresses.insert(id.clone(), ingress);
        self.reindex_ingress(id);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        self.ingresses.remove(&id);
        self.reindex_ingress(id);
    }
}

impl kubert::index::IndexClusterResource<IngressClass> for Index {
    fn apply(&mut self, class: IngressClass) {
        if self.classes.apply(&class) {
            tracing::debug!(class = %class.name_unchecked(), "Ingress classes changed");
            self.reindex_ingresses();
        }
    }

    fn delete(&mut self, name: String) {
        if self.classes.delete(&name) {
            self.reindex_ingresses();
        }
    }
}
