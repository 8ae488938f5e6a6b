use crate::conditions;
use erie_canal_controller_core::{ResourceId, CONTROLLER_NAME};
use erie_canal_controller_k8s_api::{
    self as k8s, Cluster, Condition, ResourceExt, ServiceExport,
};
use kubert::lease::Claim;
use prometheus_client::{
    metrics::{counter::Counter, histogram::Histogram},
    registry::Registry,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time,
};

/// Patches resource statuses on behalf of the controller that holds the
/// lease.
pub struct Controller {
    claims: watch::Receiver<Arc<Claim>>,
    name: String,
    updates: mpsc::Receiver<Update>,
    patch_timeout: Duration,
    metrics: ControllerMetrics,
}

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    patch_succeeded: Counter,
    patch_failed: Counter,
    patch_timeout: Counter,
    patch_dropped: Counter,
    patch_duration: Histogram,
}

/// A status patch, sent to the API server of the cluster that owns the
/// resource.
pub struct Update {
    pub client: k8s::Client,
    pub target: Target,
    pub patch: k8s::Patch<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    ServiceExport(ResourceId),
    Cluster(String),
}

// === impl Controller ===

impl Controller {
    pub fn new(
        claims: watch::Receiver<Arc<Claim>>,
        name: impl ToString,
        updates: mpsc::Receiver<Update>,
        patch_timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            claims,
            name: name.to_string(),
            updates,
            patch_timeout,
            metrics,
        }
    }

    pub async fn run(mut self) {
        let params = k8s::PatchParams::apply(CONTROLLER_NAME);
        while let Some(Update {
            client,
            target,
            patch,
        }) = self.updates.recv().await
        {
            // Followers observe the same events as the leader. Only the
            // leader writes.
            if !self.is_leader() {
                tracing::debug!(?target, "Not the leader; dropping status update");
                self.metrics.patch_dropped.inc();
                continue;
            }

            let start = time::Instant::now();
            let result = match &target {
                Target::ServiceExport(id) => {
                    let api = k8s::Api::<ServiceExport>::namespaced(client, &id.namespace);
                    time::timeout(
                        self.patch_timeout,
                        api.patch_status(&id.name, &params, &patch),
                    )
                    .await
                    .map(|res| res.map(drop))
                }
                Target::Cluster(name) => {
                    let api = k8s::Api::<Cluster>::all(client);
                    time::timeout(self.patch_timeout, api.patch_status(name, &params, &patch))
                        .await
                        .map(|res| res.map(drop))
                }
            };
            self.metrics
                .patch_duration
                .observe(start.elapsed().as_secs_f64());

            match result {
                Ok(Ok(())) => {
                    tracing::debug!(?target, "Patched status");
                    self.metrics.patch_succeeded.inc();
                }
                Ok(Err(error)) => {
                    tracing::error!(?target, %error, "Failed to patch status");
                    self.metrics.patch_failed.inc();
                }
                Err(_) => {
                    tracing::error!(?target, timeout = ?self.patch_timeout, "Status patch timed out");
                    self.metrics.patch_timeout.inc();
                }
            }
        }
    }

    fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.name)
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_succeeded = Counter::default();
        prom.register(
            "patch_succeeded",
            "Count of successful status patches",
            patch_succeeded.clone(),
        );

        let patch_failed = Counter::default();
        prom.register(
            "patch_failed",
            "Count of status patches rejected by the API server",
            patch_failed.clone(),
        );

        let patch_timeout = Counter::default();
        prom.register(
            "patch_timeout",
            "Count of status patches that timed out",
            patch_timeout.clone(),
        );

        let patch_dropped = Counter::default();
        prom.register(
            "patch_dropped",
            "Count of status updates dropped because this instance is not the leader",
            patch_dropped.clone(),
        );

        let patch_duration = Histogram::new(
            prometheus_client::metrics::histogram::exponential_buckets(0.001, 2.0, 12),
        );
        prom.register(
            "patch_duration_seconds",
            "Duration of status patches",
            patch_duration.clone(),
        );

        Self {
            patch_succeeded,
            patch_failed,
            patch_timeout,
            patch_dropped,
            patch_duration,
        }
    }
}

// === patches ===

/// Builds a status patch for `export`, or `None` if `updates` leave its
/// conditions as they are.
pub fn export_patch(
    export: &ServiceExport,
    updates: impl IntoIterator<Item = Condition>,
) -> Option<k8s::Patch<serde_json::Value>> {
    let current = export
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    let conditions = conditions::merge(current, updates)?;
    Some(make_patch::<ServiceExport>(&export.name_unchecked(), conditions))
}

/// Builds a status patch for `cluster`, or `None` if `update` leaves its
/// conditions as they are.
pub fn cluster_patch(
    cluster: &Cluster,
    update: Condition,
) -> Option<k8s::Patch<serde_json::Value>> {
    let current = cluster
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    let conditions = conditions::merge(current, [update])?;
    Some(make_patch::<Cluster>(&cluster.name_unchecked(), conditions))
}

fn make_patch<K>(name: &str, conditions: Vec<Condition>) -> k8s::Patch<serde_json::Value>
where
    K: k8s::Resource<DynamicType = ()>,
{
    k8s::Patch::Merge(serde_json::json!({
        "apiVersion": K::api_version(&()),
        "kind": K::kind(&()),
        "name": name,
        "status": {
            "conditions": conditions,
        },
    }))
}
