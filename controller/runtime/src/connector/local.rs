use super::{derived, exports::Validator, Context};
use crate::{
    core::{ClusterInfo, ResourceId, DEFAULT_INGRESS_BASE_PATH, DEFAULT_SERVICE_BASE_PATH},
    index::{
        self, Compiler, ExportEvent, Options, Resource, SharedExportIndex, SharedSecrets,
        SyncBarrier,
    },
    index_pair::IndexPair,
    k8s::{
        self, Endpoints, Ingress, IngressClass, MeshConfig, Secret, Service, ServiceExport,
        ServiceImport,
    },
    lease::Leadership,
    publish::Publisher,
    repo,
    runner::BoundedFrequency,
};
use ahash::AHashSet as HashSet;
use anyhow::Result;
use kube::runtime::watcher;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch, Mutex, Notify},
    task::JoinHandle,
    time,
};
use tracing::{debug, info, info_span, warn, Instrument};

/// Compiles at most once per 3s after a burst of 2, and at least every 30s.
const COMPILE_FREQUENCY: BoundedFrequency =
    BoundedFrequency::new(time::Duration::from_secs(3), time::Duration::from_secs(30), 2);

const DERIVE_BACKOFF_MIN: time::Duration = time::Duration::from_secs(1);
const DERIVE_BACKOFF_MAX: time::Duration = time::Duration::from_secs(30);

/// Prefix of the Ingresses created for valid exports.
pub(crate) const MANAGED_INGRESS_PREFIX: &str = "svcexp-ing-";

/// The connector of the home cluster.
pub(super) struct Local {
    pub(super) ctx: Context,
    pub(super) info: ClusterInfo,
    pub(super) client: k8s::Client,
    pub(super) exports: SharedExportIndex,
    pub(super) events_tx: mpsc::UnboundedSender<ExportEvent>,
}

/// Compiles the local indexes and publishes the snapshots.
struct Routes {
    compiler: Compiler,
    secrets: SharedSecrets,
    publisher: Publisher,
    mesh: watch::Receiver<Arc<MeshConfig>>,
    leadership: Leadership,
    revalidate: mpsc::UnboundedSender<ExportEvent>,
    /// Exports whose managed Ingress lost a path in the last run.
    collided: HashSet<ResourceId>,
}

// === impl Local ===

impl Local {
    pub(super) async fn run(
        self,
        events: mpsc::UnboundedReceiver<ExportEvent>,
        shutdown: drain::Watch,
    ) -> Result<()> {
        let mesh = (*self.ctx.mesh.borrow()).clone();
        let repo = repo::Client::new(mesh.repo_root_url())?;

        // Initializing
        let derive = derive_codebases(&repo, &mesh);
        tokio::select! {
            _ = derive => {}
            _ = shutdown.clone().signaled() => return Ok(()),
        }

        // WaitingForCaches
        let changed = Arc::new(Notify::new());
        let config = index::Config {
            ingress_class: self.ctx.settings.ingress_class.clone(),
            controller_namespace: self.ctx.settings.controller_namespace.clone(),
        };
        let (index, compiler) = index::Index::new(config, changed.clone());
        let secrets = index::Secrets::shared();
        let barrier = SyncBarrier::new();

        let services = IndexPair::shared(index.clone(), self.exports.clone());
        let imports = IndexPair::shared(index.clone(), self.exports.clone());
        let mut tasks = vec![
            self.watch::<Service, _>(&barrier, Resource::Service, services),
            self.watch::<Endpoints, _>(&barrier, Resource::Endpoints, index.clone()),
            self.watch::<Secret, _>(&barrier, Resource::Secret, secrets.clone()),
            self.watch::<ServiceImport, _>(&barrier, Resource::ServiceImport, imports),
            self.watch::<Ingress, _>(&barrier, Resource::Ingress, index.clone()),
            self.watch::<ServiceExport, _>(&barrier, Resource::ServiceExport, self.exports.clone()),
        ];
        {
            let api = k8s::Api::<IngressClass>::all(self.client.clone());
            let span = info_span!("ingressclasses");
            let events = barrier.tap(
                Resource::IngressClass,
                k8s::watch(api, watcher::Config::default(), span.clone()),
            );
            tasks.push(tokio::spawn(
                kubert::index::cluster(index.clone(), events).instrument(span),
            ));
        }

        let synced = async {
            barrier
                .wait_for(&[
                    Resource::Service,
                    Resource::Endpoints,
                    Resource::IngressClass,
                    Resource::Secret,
                ])
                .await;
            barrier.wait_for(&[Resource::ServiceImport]).await;
            barrier.wait_for(&[Resource::Ingress]).await;
        };
        tokio::select! {
            _ = synced => {}
            _ = shutdown.clone().signaled() => {
                abort_all(tasks);
                return Ok(());
            }
        }

        // Active
        info!(cluster = %self.info.key, "Caches synced");
        self.ctx.ready.send_replace(true);

        let validator = Validator {
            client: self.client.clone(),
            index: index.clone(),
            exports: self.exports.clone(),
            status: self.ctx.status.clone(),
            leadership: self.ctx.leadership.clone(),
            ingress_class: self.ctx.settings.ingress_class.clone(),
        };
        tasks.push(tokio::spawn(
            validator.run(events).instrument(info_span!("exports")),
        ));

        let routes = Arc::new(Mutex::new(Routes {
            compiler,
            secrets,
            publisher: Publisher::new(
                repo,
                mesh.default_services_path(),
                mesh.default_ingress_path(),
                self.ctx.publish_metrics.clone(),
            ),
            mesh: self.ctx.mesh.clone(),
            leadership: self.ctx.leadership.clone(),
            revalidate: self.events_tx.clone(),
            collided: HashSet::new(),
        }));
        tasks.push(tokio::spawn(
            COMPILE_FREQUENCY
                .run(changed.clone(), shutdown.clone(), move || {
                    let routes = routes.clone();
                    async move { routes.lock().await.sync().await }
                })
                .instrument(info_span!("routes")),
        ));

        tasks.push(tokio::spawn(
            resync(
                self.ctx.settings.resync_period,
                self.exports.clone(),
                self.events_tx.clone(),
                changed,
            )
            .instrument(info_span!("resync")),
        ));

        if mesh.features_gate.create_service_for_mcs {
            tasks.push(tokio::spawn(
                derived::run(self.client.clone(), self.ctx.leadership.clone())
                    .instrument(info_span!("derived")),
            ));
        }

        // Stopped
        let release = shutdown.signaled().await;
        debug!(cluster = %self.info.key, "Stopping");
        abort_all(tasks);
        drop(release);
        Ok(())
    }

    fn watch<T, I>(
        &self,
        barrier: &SyncBarrier,
        resource: Resource,
        index: Arc<parking_lot::RwLock<I>>,
    ) -> JoinHandle<()>
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
        let events = barrier.tap(
            resource,
            k8s::watch(api, watcher::Config::default(), span.clone()),
        );
        tokio::spawn(kubert::index::namespaced(index, events).instrument(span))
    }
}

fn abort_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        task.abort();
    }
}

/// Derives the local codebases from the base codebases, retrying with backoff
/// until it succeeds.
async fn derive_codebases(repo: &repo::Client, mesh: &MeshConfig) {
    let mut backoff = DERIVE_BACKOFF_MIN;
    loop {
        match derive_once(repo, mesh).await {
            Ok(()) => return,
            Err(error) => {
                warn!(%error, ?backoff, "Failed to derive codebases");
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(DERIVE_BACKOFF_MAX);
            }
        }
    }
}

pub(crate) async fn derive_once(repo: &repo::Client, mesh: &MeshConfig) -> Result<(), repo::Error> {
    repo.derive(mesh.default_services_path(), DEFAULT_SERVICE_BASE_PATH)
        .await?;
    repo.derive(mesh.default_ingress_path(), DEFAULT_INGRESS_BASE_PATH)
        .await
}

/// Periodically revalidates every export and recompiles, covering changes
/// that no watch event reports.
async fn resync(
    period: time::Duration,
    exports: SharedExportIndex,
    events: mpsc::UnboundedSender<ExportEvent>,
    changed: Arc<Notify>,
) {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let ids = exports
            .read()
            .exports()
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        debug!(exports = ids.len(), "Resync");
        for id in ids {
            if events.send(ExportEvent::Revalidate(id)).is_err() {
                return;
            }
        }
        changed.notify_one();
    }
}

// === impl Routes ===

impl Routes {
    async fn sync(&mut self) {
        let mesh = (*self.mesh.borrow()).clone();
        let options = Options {
            ssl_passthrough: mesh.ssl_passthrough_port(),
        };
        let compiled = self.compiler.compile(&self.secrets, &options);

        // A managed Ingress that loses a path to another Ingress invalidates
        // its export. Exports are revalidated when they start or stop losing.
        let collided = compiled
            .collisions
            .iter()
            .filter_map(|c| {
                let export = c.loser.name.strip_prefix(MANAGED_INGRESS_PREFIX)?;
                Some(ResourceId::new(&c.loser.namespace, export))
            })
            .collect::<HashSet<_>>();
        for id in collided.symmetric_difference(&self.collided) {
            if self.revalidate.send(ExportEvent::Revalidate(id.clone())).is_err() {
                warn!(export = %id, "Export validator has stopped; cannot revalidate");
            }
        }
        self.collided = collided;

        if !self.leadership.is_leader() {
            debug!("Not the leader; skipping publish");
            return;
        }
        self.publisher.publish_services(&compiled.services).await;
        if mesh.ingress_enabled() {
            self.publisher.publish_ingress(&compiled.ingress).await;
        }
    }
}
