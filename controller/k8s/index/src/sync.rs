use ahash::AHashSet as HashSet;
use futures::prelude::*;
use kube::runtime::watcher;
use std::sync::Arc;
use tokio::sync::watch;

/// The resource types observed in a member cluster.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Resource {
    Service,
    Endpoints,
    IngressClass,
    Secret,
    ServiceImport,
    Ingress,
    ServiceExport,
}

/// Tracks which watches have completed their initial listing.
///
/// Clones share state.
#[derive(Clone, Debug)]
pub struct SyncBarrier {
    synced: Arc<watch::Sender<HashSet<Resource>>>,
}

// === impl SyncBarrier ===

impl Default for SyncBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncBarrier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(HashSet::new());
        Self {
            synced: Arc::new(tx),
        }
    }

    pub fn mark_synced(&self, resource: Resource) {
        self.synced.send_if_modified(|synced| synced.insert(resource));
    }

    pub fn has_synced(&self, resource: Resource) -> bool {
        self.synced.borrow().contains(&resource)
    }

    /// True when every resource in `resources` has synced.
    pub fn is_initialized(&self, resources: &[Resource]) -> bool {
        let synced = self.synced.borrow();
        resources.iter().all(|r| synced.contains(r))
    }

    /// Completes once every resource in `resources` has synced.
    pub async fn wait_for(&self, resources: &[Resource]) {
        let mut rx = self.synced.subscribe();
        // The sender is owned by `self`, so the channel cannot close while we
        // wait.
        let _ = rx
            .wait_for(|synced| resources.iter().all(|r| synced.contains(r)))
            .await;
    }

    /// Marks `resource` as synced when `events` reports the end of its
    /// initial listing. Events are passed through unchanged.
    pub fn tap<T, S>(&self, resource: Resource, events: S) -> impl Stream<Item = watcher::Event<T>>
    where
        S: Stream<Item = watcher::Event<T>>,
    {
        let barrier = self.clone();
        events.inspect(move |ev| {
            if matches!(ev, watcher::Event::InitDone) {
                tracing::debug!(?resource, "Synced");
                barrier.mark_synced(resource);
            }
        })
    }
}
