//! Runs one connector per Cluster and adjudicates the cluster set's exports.
//!
//! The reconciler is the only writer of the connector table. Every change to
//! the table, and every adjudication that reads it, happens under a single
//! lock so that an export is never judged against a half-updated set of
//! peers.

use crate::{
    clusters::ClusterEvent,
    connector::{resource_id, Context, Launch, Launched, Peer},
    core::ClusterKey,
    events::{Message, ServiceExportEvent, Topic},
    k8s::{Cluster, MeshConfig, ResourceExt},
    status::{self, conditions},
};
use ahash::AHashMap as HashMap;
use futures::future;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, Mutex},
    time,
};
use tracing::{debug, info, info_span, warn, Instrument};

const LAUNCH_RETRY_DELAY: time::Duration = time::Duration::from_secs(10);

pub struct Reconciler {
    ctx: Context,
    launcher: Arc<dyn Launch>,
    connectors: Mutex<Connectors>,
    requeue: mpsc::UnboundedSender<Requeue>,
}

#[derive(Debug)]
pub enum Requeue {
    /// Reconciles the named Cluster again.
    Retry(String),
    /// A connector stopped with an error.
    Failed {
        name: String,
        key: ClusterKey,
        id: u64,
        error: String,
    },
}

/// The outcome of adjudicating a created export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

#[derive(Default)]
struct Connectors {
    next_id: u64,
    by_key: HashMap<ClusterKey, Connector>,
}

struct Connector {
    id: u64,
    spec_hash: String,
    peer: Arc<dyn Peer>,
    stop: drain::Signal,
}

// === impl Reconciler ===

impl Reconciler {
    pub fn new(ctx: Context, launcher: Arc<dyn Launch>) -> (Self, mpsc::UnboundedReceiver<Requeue>) {
        let (requeue, requeue_rx) = mpsc::unbounded_channel();
        let reconciler = Self {
            ctx,
            launcher,
            connectors: Mutex::new(Connectors::default()),
            requeue,
        };
        (reconciler, requeue_rx)
    }

    pub async fn run(
        self,
        mut clusters: mpsc::UnboundedReceiver<ClusterEvent>,
        mut requeue: mpsc::UnboundedReceiver<Requeue>,
        shutdown: drain::Watch,
    ) {
        let broker = self.ctx.broker.clone();
        let mut created = broker.subscribe(Topic::ServiceExportCreated);

        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(event) = clusters.recv() => match event {
                    ClusterEvent::Applied(cluster) => self.apply(&cluster).await,
                    ClusterEvent::Deleted(cluster) => self.delete(&cluster).await,
                },
                Some(requeue) = requeue.recv() => self.requeue(requeue).await,
                Some(message) = created.recv() => self.adjudicate(&message).await,
                else => break,
            }
        }

        broker.unsubscribe(created);
        self.stop_all().await;
    }

    /// Starts a connector for `cluster`, replacing one whose spec is stale.
    pub(crate) async fn apply(&self, cluster: &Cluster) {
        if cluster.metadata.deletion_timestamp.is_some() {
            return self.delete(cluster).await;
        }

        let mesh = self.mesh();
        let key = connector_key(cluster, &mesh);
        let spec_hash = cluster.spec_hash();

        let mut connectors = self.connectors.lock().await;
        if let Some(connector) = connectors.by_key.get(&key) {
            if connector.spec_hash == spec_hash {
                debug!(cluster = %key, "Connector is up to date");
                return;
            }
        }
        if let Some(stale) = connectors.by_key.remove(&key) {
            info!(cluster = %key, "Cluster changed; restarting connector");
            stale.stop();
        }

        let (stop, shutdown) = drain::channel();
        let Launched { peer, task } = match self.launcher.launch(cluster, shutdown).await {
            Ok(launched) => launched,
            Err(error) => {
                warn!(cluster = %key, error = %format_args!("{error:#}"), "Failed to start connector");
                self.report(cluster, &key, Err(format!("{error:#}"))).await;
                self.retry(cluster.name_unchecked(), LAUNCH_RETRY_DELAY);
                return;
            }
        };

        let id = connectors.next_id;
        connectors.next_id += 1;
        let name = cluster.name_unchecked();
        let requeue = self.requeue.clone();
        let failed_key = key.clone();
        tokio::spawn(
            async move {
                if let Err(error) = task.await {
                    let _ = requeue.send(Requeue::Failed {
                        name,
                        key: failed_key,
                        id,
                        error: format!("{error:#}"),
                    });
                }
            }
            .instrument(info_span!("connector", id)),
        );
        connectors.by_key.insert(
            key.clone(),
            Connector {
                id,
                spec_hash,
                peer,
                stop,
            },
        );
        drop(connectors);

        info!(cluster = %key, "Started connector");
        self.report(cluster, &key, Ok(())).await;
    }

    /// Stops the connector for `cluster` and removes the endpoints it
    /// contributed to the remaining members.
    pub(crate) async fn delete(&self, cluster: &Cluster) {
        let key = connector_key(cluster, &self.mesh());
        let mut connectors = self.connectors.lock().await;
        if let Some(connector) = connectors.by_key.remove(&key) {
            info!(cluster = %key, "Stopping connector");
            connector.stop();
        }
        let peers = connectors
            .by_key
            .values()
            .map(|c| c.peer.clone())
            .collect::<Vec<_>>();
        drop(connectors);

        future::join_all(peers.iter().map(|p| p.remove_cluster_endpoints(&key))).await;
    }

    async fn requeue(&self, requeue: Requeue) {
        match requeue {
            Requeue::Retry(name) => {
                let cluster = self.ctx.clusters.read().get(&name).cloned();
                match cluster {
                    Some(cluster) => self.apply(&cluster).await,
                    None => debug!(%name, "Cluster no longer exists"),
                }
            }
            Requeue::Failed {
                name,
                key,
                id,
                error,
            } => {
                let mut connectors = self.connectors.lock().await;
                // A newer connector may already have replaced the one that
                // failed.
                if connectors.by_key.get(&key).map(|c| c.id) != Some(id) {
                    return;
                }
                if let Some(connector) = connectors.by_key.remove(&key) {
                    connector.stop();
                }
                drop(connectors);

                warn!(cluster = %key, %error, "Connector failed");
                let cluster = self.ctx.clusters.read().get(&name).cloned();
                if let Some(cluster) = cluster {
                    self.report(&cluster, &key, Err(error)).await;
                }
                self.retry(name, LAUNCH_RETRY_DELAY);
            }
        }
    }

    /// Decides whether a created export joins the cluster set and announces
    /// the verdict to every connector.
    pub(crate) async fn adjudicate(&self, message: &Message) {
        if !self.ctx.leadership.is_leader() {
            return;
        }

        let mesh = self.mesh();
        let connectors = self.connectors.lock().await;
        let verdict = adjudicate(
            &mesh,
            &message.event,
            connectors.by_key.values().map(|c| c.peer.as_ref()),
        );
        drop(connectors);

        let id = message.event.export_id();
        let cluster = &message.event.geo.key;
        match verdict {
            Some(Verdict::Accept) => {
                info!(%cluster, export = %id, "Accepted export");
                self.ctx
                    .broker
                    .enqueue(message.with_topic(Topic::ServiceExportAccepted, None));
            }
            Some(Verdict::Reject(error)) => {
                info!(%cluster, export = %id, %error, "Rejected export");
                self.ctx
                    .broker
                    .enqueue(message.with_topic(Topic::ServiceExportRejected, Some(error)));
            }
            None => debug!(%cluster, export = %id, "Export not adjudicated"),
        }
    }

    async fn stop_all(&self) {
        let mut connectors = self.connectors.lock().await;
        let signals = connectors
            .by_key
            .drain()
            .map(|(_, c)| c.stop.drain())
            .collect::<Vec<_>>();
        future::join_all(signals).await;
    }

    async fn report(&self, cluster: &Cluster, key: &ClusterKey, result: Result<(), String>) {
        if cluster.spec.is_in_cluster {
            return;
        }
        let condition = conditions::managed(key, result, cluster.metadata.generation);
        let Some(patch) = status::cluster_patch(cluster, condition) else {
            return;
        };
        let update = status::Update {
            client: self.ctx.home.clone(),
            target: status::Target::Cluster(cluster.name_unchecked()),
            patch,
        };
        if self.ctx.status.send(update).await.is_err() {
            debug!("Status controller has stopped");
        }
    }

    fn retry(&self, name: String, delay: time::Duration) {
        let requeue = self.requeue.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = requeue.send(Requeue::Retry(name));
        });
    }

    fn mesh(&self) -> Arc<MeshConfig> {
        self.ctx.mesh.borrow().clone()
    }

    #[cfg(test)]
    async fn connector_keys(&self) -> Vec<String> {
        let mut keys = self
            .connectors
            .lock()
            .await
            .by_key
            .keys()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }
}

// === impl Connector ===

impl Connector {
    fn stop(self) {
        tokio::spawn(self.stop.drain());
    }
}

/// The home cluster is keyed by the MeshConfig; every other cluster by its
/// Cluster resource.
fn connector_key(cluster: &Cluster, mesh: &MeshConfig) -> ClusterKey {
    if cluster.spec.is_in_cluster {
        mesh.cluster_key()
    } else {
        cluster.key()
    }
}

/// Judges a created export against the other members of the cluster set.
///
/// Returns `None` when this control plane does not adjudicate the export: it
/// is itself managed by another control plane, or the export has not passed
/// validation in its own cluster. The export is accepted if no other member
/// imports the service yet, or if it is compatible with the export accepted
/// by every member that does.
pub fn adjudicate<'p>(
    mesh: &MeshConfig,
    event: &ServiceExportEvent,
    peers: impl IntoIterator<Item = &'p dyn Peer>,
) -> Option<Verdict> {
    if mesh.is_managed && !mesh.is_control_plane() {
        return None;
    }
    let export = &event.export;
    if !export.is_valid() || export.is_conflicting() {
        return None;
    }

    let id = resource_id(export);
    let peers = peers
        .into_iter()
        .filter(|p| !p.info().in_cluster && p.info().key != event.geo.key)
        .collect::<Vec<_>>();
    if !peers.iter().any(|p| p.service_import_exists(&id)) {
        return Some(Verdict::Accept);
    }
    for peer in peers {
        if let Err(conflict) = peer.validate_export(export) {
            return Some(Verdict::Reject(conflict.to_string()));
        }
    }
    Some(Verdict::Accept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{
            export::{Conflict, PortSet},
            ClusterInfo, ResourceId,
        },
        k8s::{ClusterSpec, ServiceExport},
        tests::{conflicting, invalid, mk_cluster, mk_context, mk_event, mk_info, mk_key},
    };
    use anyhow::{bail, Result};
    use futures::{future::BoxFuture, FutureExt};
    use parking_lot::Mutex as SyncMutex;
    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    struct FakePeer {
        info: ClusterInfo,
        imports: Vec<ResourceId>,
        conflict: Option<Conflict>,
        removed: SyncMutex<Vec<ClusterKey>>,
    }

    #[async_trait::async_trait]
    impl Peer for FakePeer {
        fn info(&self) -> &ClusterInfo {
            &self.info
        }

        fn service_import_exists(&self, id: &ResourceId) -> bool {
            self.imports.contains(id)
        }

        fn validate_export(&self, _: &ServiceExport) -> Result<(), Conflict> {
            match &self.conflict {
                Some(conflict) => Err(conflict.clone()),
                None => Ok(()),
            }
        }

        async fn remove_cluster_endpoints(&self, cluster: &ClusterKey) {
            self.removed.lock().push(cluster.clone());
        }
    }

    fn peer(name: &str) -> FakePeer {
        FakePeer {
            info: mk_info(name),
            imports: vec![],
            conflict: None,
            removed: SyncMutex::new(vec![]),
        }
    }

    fn importing(name: &str) -> FakePeer {
        FakePeer {
            imports: vec![ResourceId::new("demo", "api")],
            ..peer(name)
        }
    }

    fn ports_conflict(name: &str) -> Conflict {
        Conflict::Ports {
            cluster: mk_key(name),
            ours: PortSet([80].into()),
            theirs: PortSet([8080].into()),
        }
    }

    fn judge(mesh: &MeshConfig, event: &ServiceExportEvent, peers: &[FakePeer]) -> Option<Verdict> {
        adjudicate(mesh, event, peers.iter().map(|p| p as &dyn Peer))
    }

    #[test]
    fn first_export_of_a_service_is_accepted() {
        let event = mk_event("a", "demo", "api");
        let peers = [peer("b"), peer("c")];
        assert_eq!(
            judge(&MeshConfig::default(), &event, &peers),
            Some(Verdict::Accept)
        );
    }

    #[test]
    fn compatible_exports_are_accepted() {
        let event = mk_event("a", "demo", "api");
        let peers = [importing("b"), peer("c")];
        assert_eq!(
            judge(&MeshConfig::default(), &event, &peers),
            Some(Verdict::Accept)
        );
    }

    #[test]
    fn incompatible_exports_are_rejected() {
        let event = mk_event("a", "demo", "api");
        let peers = [
            importing("b"),
            FakePeer {
                conflict: Some(ports_conflict("c")),
                ..importing("c")
            },
        ];
        let Some(Verdict::Reject(error)) = judge(&MeshConfig::default(), &event, &peers) else {
            panic!("export must be rejected");
        };
        assert!(
            error.starts_with("conflicts with the export in cluster default/default/default/c"),
            "{error}"
        );
    }

    #[test]
    fn home_cluster_and_sender_are_not_consulted() {
        let event = mk_event("a", "demo", "api");
        let mut home = FakePeer {
            conflict: Some(ports_conflict("home")),
            ..importing("home")
        };
        home.info.in_cluster = true;
        let sender = FakePeer {
            conflict: Some(ports_conflict("a")),
            ..importing("a")
        };
        assert_eq!(
            judge(&MeshConfig::default(), &event, &[home, sender]),
            Some(Verdict::Accept)
        );
    }

    #[test]
    fn unvalidated_or_conflicting_exports_are_skipped() {
        let mut event = mk_event("a", "demo", "api");
        event.export = invalid(event.export);
        assert_eq!(judge(&MeshConfig::default(), &event, &[peer("b")]), None);

        let mut event = mk_event("a", "demo", "api");
        event.export = conflicting(event.export);
        assert_eq!(judge(&MeshConfig::default(), &event, &[peer("b")]), None);

        let mut event = mk_event("a", "demo", "api");
        event.export.status = None;
        assert_eq!(judge(&MeshConfig::default(), &event, &[peer("b")]), None);
    }

    #[test]
    fn managed_control_planes_do_not_adjudicate() {
        let event = mk_event("a", "demo", "api");
        let mut mesh = MeshConfig::default();
        mesh.is_managed = true;
        mesh.cluster.uid = "uid-1".to_string();
        mesh.cluster.control_plane_uid = "uid-0".to_string();
        assert_eq!(judge(&mesh, &event, &[peer("b")]), None);

        // A cluster managed by itself is still a control plane.
        mesh.cluster.control_plane_uid = "uid-1".to_string();
        assert_eq!(judge(&mesh, &event, &[peer("b")]), Some(Verdict::Accept));
    }

    /// Launches fake peers whose tasks complete when the test says so.
    #[derive(Default)]
    struct FakeLauncher {
        launches: SyncMutex<Vec<String>>,
        fail: SyncMutex<bool>,
        peers: SyncMutex<Vec<Arc<FakePeer>>>,
        tasks: SyncMutex<Vec<oneshot::Sender<Result<()>>>>,
    }

    #[async_trait::async_trait]
    impl Launch for FakeLauncher {
        async fn launch(&self, cluster: &Cluster, _: drain::Watch) -> Result<Launched> {
            self.launches.lock().push(cluster.name_unchecked());
            if *self.fail.lock() {
                bail!("cluster unreachable");
            }
            let peer = Arc::new(peer(&cluster.name_unchecked()));
            self.peers.lock().push(peer.clone());
            let (tx, rx) = oneshot::channel();
            self.tasks.lock().push(tx);
            let task: BoxFuture<'static, Result<()>> =
                rx.map(|res| res.unwrap_or(Ok(()))).boxed();
            Ok(Launched { peer, task })
        }
    }

    fn managed_status(update: &status::Update) -> (String, String) {
        let crate::k8s::Patch::Merge(patch) = &update.patch else {
            panic!("expected a merge patch");
        };
        let condition = &patch["status"]["conditions"][0];
        assert_eq!(condition["type"], "Managed");
        (
            condition["status"].as_str().unwrap().to_string(),
            condition["message"].as_str().unwrap().to_string(),
        )
    }

    #[tokio::test]
    async fn unchanged_clusters_keep_their_connector() {
        let (ctx, mut status) = mk_context();
        let launcher = Arc::new(FakeLauncher::default());
        let (reconciler, _requeue) = Reconciler::new(ctx, launcher.clone());

        let cluster = mk_cluster("b", false);
        reconciler.apply(&cluster).await;
        reconciler.apply(&cluster).await;
        assert_eq!(*launcher.launches.lock(), vec!["b"]);
        assert_eq!(reconciler.connector_keys().await, vec!["default/default/default/b"]);

        let update = status.try_recv().expect("Managed must be reported");
        assert_eq!(update.target, status::Target::Cluster("b".to_string()));
        assert_eq!(managed_status(&update).0, "True");

        let mut changed = cluster.clone();
        changed.spec.gateway_port = Some(8091);
        reconciler.apply(&changed).await;
        assert_eq!(*launcher.launches.lock(), vec!["b", "b"]);
    }

    #[tokio::test]
    async fn home_cluster_is_not_reported() {
        let (ctx, mut status) = mk_context();
        let launcher = Arc::new(FakeLauncher::default());
        let (reconciler, _requeue) = Reconciler::new(ctx, launcher.clone());

        reconciler.apply(&mk_cluster("home", true)).await;
        assert_eq!(reconciler.connector_keys().await, vec!["default/default/default/home"]);
        assert!(status.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_launches_are_reported_and_retried() {
        let (ctx, mut status) = mk_context();
        let clusters = ctx.clusters.clone();
        let launcher = Arc::new(FakeLauncher::default());
        *launcher.fail.lock() = true;
        let (reconciler, mut requeue) = Reconciler::new(ctx, launcher.clone());

        let cluster = mk_cluster("b", false);
        kubert::index::IndexClusterResource::apply(&mut *clusters.write(), cluster.clone());
        reconciler.apply(&cluster).await;
        assert!(reconciler.connector_keys().await.is_empty());
        let (state, message) = managed_status(&status.try_recv().expect("failure must be reported"));
        assert_eq!(state, "False");
        assert!(message.contains("cluster unreachable"), "{message}");

        *launcher.fail.lock() = false;
        let retry = requeue.recv().await.expect("launch must be retried");
        reconciler.requeue(retry).await;
        assert_eq!(reconciler.connector_keys().await, vec!["default/default/default/b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connectors_are_removed() {
        let (ctx, _status) = mk_context();
        let launcher = Arc::new(FakeLauncher::default());
        let (reconciler, mut requeue) = Reconciler::new(ctx, launcher.clone());

        reconciler.apply(&mk_cluster("b", false)).await;
        let task = launcher.tasks.lock().remove(0);
        let _ = task.send(Err(anyhow::anyhow!("watch failed")));

        let failed = requeue.recv().await.expect("failure must be requeued");
        assert!(matches!(&failed, Requeue::Failed { name, .. } if name == "b"));
        reconciler.requeue(failed).await;
        assert!(reconciler.connector_keys().await.is_empty());
    }

    #[tokio::test]
    async fn deleted_clusters_leave_the_cluster_set() {
        let (ctx, _status) = mk_context();
        let launcher = Arc::new(FakeLauncher::default());
        let (reconciler, _requeue) = Reconciler::new(ctx, launcher.clone());

        let b = mk_cluster("b", false);
        reconciler.apply(&b).await;
        reconciler.apply(&mk_cluster("c", false)).await;
        reconciler.delete(&b).await;

        assert_eq!(reconciler.connector_keys().await, vec!["default/default/default/c"]);
        let peers = launcher.peers.lock().clone();
        assert!(peers[0].removed.lock().is_empty());
        assert_eq!(*peers[1].removed.lock(), vec![mk_key("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn verdicts_are_announced() {
        let (ctx, _status) = mk_context();
        let broker = ctx.broker.clone();
        let mut accepted = broker.subscribe(Topic::ServiceExportAccepted);
        let launcher = Arc::new(FakeLauncher::default());
        let (reconciler, _requeue) = Reconciler::new(ctx, launcher);
        reconciler.apply(&mk_cluster("b", false)).await;

        let message = Message::new(Topic::ServiceExportCreated, mk_event("a", "demo", "api"));
        reconciler.adjudicate(&message).await;
        let msg = accepted.recv().await.expect("verdict must be published");
        assert_eq!(msg.event.export_id(), ResourceId::new("demo", "api"));
        assert!(msg.event.error.is_none());
    }

    #[test]
    fn home_cluster_is_keyed_by_mesh_config() {
        let mut mesh = MeshConfig::default();
        mesh.cluster.name = "home".to_string();
        mesh.cluster.region = "eu".to_string();
        let cluster = Cluster::new(
            "local",
            ClusterSpec {
                is_in_cluster: true,
                ..Default::default()
            },
        );
        assert_eq!(
            connector_key(&cluster, &mesh),
            ClusterKey::new("eu", "", "", "home")
        );
        assert_eq!(
            connector_key(&mk_cluster("b", false), &mesh),
            mk_key("b")
        );
    }
}
