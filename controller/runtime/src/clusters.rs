use crate::{
    core::ClusterKey,
    k8s::{Cluster, ResourceExt},
};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub type SharedClusters = Arc<RwLock<Clusters>>;

#[derive(Clone, Debug)]
pub enum ClusterEvent {
    Applied(Box<Cluster>),
    Deleted(Box<Cluster>),
}

/// Indexes the Cluster resources of the home cluster.
///
/// Admission consults the index to keep keys and the in-cluster member
/// unique; the reconciler consumes its events.
#[derive(Debug)]
pub struct Clusters {
    by_name: HashMap<String, Cluster>,
    events: UnboundedSender<ClusterEvent>,
}

// === impl Clusters ===

impl Clusters {
    pub fn shared(events: UnboundedSender<ClusterEvent>) -> SharedClusters {
        Arc::new(RwLock::new(Self {
            by_name: HashMap::new(),
            events,
        }))
    }

    pub fn get(&self, name: &str) -> Option<&Cluster> {
        self.by_name.get(name)
    }

    /// The Cluster describing the home cluster, if any.
    pub fn in_cluster(&self) -> Option<&Cluster> {
        self.by_name.values().find(|c| c.spec.is_in_cluster)
    }

    pub fn by_key(&self, key: &ClusterKey) -> Option<&Cluster> {
        self.by_name.values().find(|c| c.key() == *key)
    }

    fn send(&self, event: ClusterEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Cluster events receiver dropped");
        }
    }
}

impl kubert::index::IndexClusterResource<Cluster> for Clusters {
    fn apply(&mut self, cluster: Cluster) {
        let name = cluster.name_unchecked();
        let changed = self
            .by_name
            .get(&name)
            .map(|c| {
                c.spec != cluster.spec
                    || c.metadata.deletion_timestamp != cluster.metadata.deletion_timestamp
            })
            .unwrap_or(true);
        self.by_name.insert(name, cluster.clone());
        if changed {
            self.send(ClusterEvent::Applied(Box::new(cluster)));
        }
    }

    fn delete(&mut self, name: String) {
        if let Some(cluster) = self.by_name.remove(&name) {
            self.send(ClusterEvent::Deleted(Box::new(cluster)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::mk_cluster;
    use kubert::index::IndexClusterResource;
    use tokio::sync::mpsc;

    #[test]
    fn status_updates_are_not_reconciled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let clusters = Clusters::shared(tx);

        let cluster = mk_cluster("c1", false);
        clusters.write().apply(cluster.clone());
        assert!(matches!(rx.try_recv(), Ok(ClusterEvent::Applied(_))));

        let mut managed = cluster.clone();
        managed.status = Some(Default::default());
        clusters.write().apply(managed);
        assert!(rx.try_recv().is_err());

        let mut moved = cluster;
        moved.spec.gateway_port = Some(8091);
        clusters.write().apply(moved);
        assert!(matches!(rx.try_recv(), Ok(ClusterEvent::Applied(c)) if c.spec.gateway_port == Some(8091)));

        clusters.write().delete("c1".to_string());
        assert!(matches!(rx.try_recv(), Ok(ClusterEvent::Deleted(_))));
        clusters.write().delete("c1".to_string());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn lookups() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let clusters = Clusters::shared(tx);
        clusters.write().apply(mk_cluster("home", true));
        clusters.write().apply(mk_cluster("c1", false));

        let index = clusters.read();
        assert_eq!(
            index.in_cluster().map(|c| c.name_unchecked()).as_deref(),
            Some("home")
        );
        let key = ClusterKey::new("", "", "", "c1");
        assert_eq!(
            index.by_key(&key).map(|c| c.name_unchecked()).as_deref(),
            Some("c1")
        );
        assert!(index.get("c2").is_none());
    }
}
