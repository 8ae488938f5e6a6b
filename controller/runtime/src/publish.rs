use crate::{
    core::routes::{IngressSnapshot, ServiceSnapshot},
    repo::{self, Batch},
};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use tracing::{debug, error, info};

const CONFIG_DIR: &str = "/config";
const REGISTRY_FILE: &str = "registry.json";
const INGRESS_FILE: &str = "ingress.json";

/// Commits compiled snapshots into a member cluster's codebases.
///
/// Each snapshot is committed only when its hash differs from the last one
/// committed. The cached hash advances only once a commit succeeds, so a
/// failed publish is retried on the next run.
pub struct Publisher {
    repo: repo::Client,
    services_path: String,
    ingress_path: String,
    services_hash: Option<String>,
    ingress_hash: Option<String>,
    metrics: PublishMetrics,
}

#[derive(Clone, Debug)]
pub struct PublishMetrics {
    commits: Counter,
    failures: Counter,
}

// === impl Publisher ===

impl Publisher {
    pub fn new(
        repo: repo::Client,
        services_path: impl Into<String>,
        ingress_path: impl Into<String>,
        metrics: PublishMetrics,
    ) -> Self {
        Self {
            repo,
            services_path: services_path.into(),
            ingress_path: ingress_path.into(),
            services_hash: None,
            ingress_hash: None,
            metrics,
        }
    }

    /// Commits `registry.json` if the service snapshot changed. Returns true
    /// if the snapshot is now committed.
    pub async fn publish_services(&mut self, snapshot: &ServiceSnapshot) -> bool {
        if self.services_hash.as_deref() == Some(snapshot.hash()) {
            debug!(hash = %snapshot.hash(), "Service snapshot unchanged");
            return true;
        }

        let Some(content) = to_json(&snapshot.registry()) else {
            return false;
        };
        let batch = Batch::new(&self.services_path).with_item(CONFIG_DIR, REGISTRY_FILE, content);
        if self.commit(batch).await {
            info!(path = %self.services_path, hash = %snapshot.hash(), routes = snapshot.routes().len(), "Published services");
            self.services_hash = Some(snapshot.hash().to_string());
            return true;
        }
        false
    }

    /// Commits `ingress.json` if the ingress snapshot changed. Returns true
    /// if the snapshot is now committed.
    pub async fn publish_ingress(&mut self, snapshot: &IngressSnapshot) -> bool {
        if self.ingress_hash.as_deref() == Some(snapshot.hash()) {
            debug!(hash = %snapshot.hash(), "Ingress snapshot unchanged");
            return true;
        }

        let Some(content) = to_json(&snapshot.config()) else {
            return false;
        };
        let batch = Batch::new(&self.ingress_path).with_item(CONFIG_DIR, INGRESS_FILE, content);
        if self.commit(batch).await {
            info!(path = %self.ingress_path, hash = %snapshot.hash(), routes = snapshot.routes().len(), "Published ingress");
            self.ingress_hash = Some(snapshot.hash().to_string());
            return true;
        }
        false
    }

    async fn commit(&self, batch: Batch) -> bool {
        match self.repo.batch(&[batch]).await {
            Ok(()) => {
                self.metrics.commits.inc();
                true
            }
            Err(error) => {
                error!(%error, "Failed to publish snapshot");
                self.metrics.failures.inc();
                false
            }
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Option<String> {
    match serde_json::to_string_pretty(value) {
        Ok(json) => Some(json),
        Err(error) => {
            error!(%error, "Failed to encode snapshot");
            None
        }
    }
}

// === impl PublishMetrics ===

impl PublishMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let commits = Counter::default();
        prom.register("commits", "Count of snapshots committed", commits.clone());

        let failures = Counter::default();
        prom.register(
            "failures",
            "Count of snapshot commits that failed",
            failures.clone(),
        );

        Self { commits, failures }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::routes::{ServiceRoute, Target},
        repo::fake::FakeRepo,
    };
    use pretty_assertions::assert_eq;

    fn snapshot(ips: &[&str]) -> ServiceSnapshot {
        ServiceSnapshot::new(vec![ServiceRoute {
            name: "api".to_string(),
            namespace: "demo".to_string(),
            port_name: "http".to_string(),
            targets: ips
                .iter()
                .map(|ip| Target::local(ip, 8080, "node-0", ""))
                .collect(),
        }])
    }

    async fn mk_publisher() -> (FakeRepo, Publisher, PublishMetrics) {
        let (fake, url) = FakeRepo::spawn().await;
        fake.seed("/local/services", &[]);
        fake.seed("/local/ingress", &[]);
        let metrics = PublishMetrics::register(&mut Registry::default());
        let publisher = Publisher::new(
            repo::Client::new(&url).expect("client must build"),
            "/local/services",
            "/local/ingress",
            metrics.clone(),
        );
        (fake, publisher, metrics)
    }

    #[tokio::test]
    async fn commits_only_changes() {
        let (fake, mut publisher, metrics) = mk_publisher().await;

        assert!(publisher.publish_services(&snapshot(&["10.0.0.1"])).await);
        assert_eq!(fake.version("/local/services"), Some(2));
        let registry: serde_json::Value = serde_json::from_str(
            &fake
                .file("/local/services/config/registry.json")
                .expect("registry must be committed"),
        )
        .expect("registry must be json");
        assert_eq!(
            registry["services"]["demo/api:http"],
            serde_json::json!(["10.0.0.1:8080"])
        );

        // Same content: nothing to commit.
        assert!(publisher.publish_services(&snapshot(&["10.0.0.1"])).await);
        assert_eq!(fake.version("/local/services"), Some(2));

        assert!(publisher.publish_services(&snapshot(&["10.0.0.1", "10.0.0.2"])).await);
        assert_eq!(fake.version("/local/services"), Some(3));
        assert_eq!(metrics.commits.get(), 2);
    }

    #[tokio::test]
    async fn outage_is_retried_on_the_next_run() {
        let (fake, mut publisher, metrics) = mk_publisher().await;
        assert!(publisher.publish_services(&snapshot(&["10.0.0.1"])).await);

        fake.set_down(true);
        let next = snapshot(&["10.0.0.2"]);
        assert!(!publisher.publish_services(&next).await);
        assert_eq!(metrics.failures.get(), 1);
        assert_eq!(fake.version("/local/services"), Some(2));

        // The hash did not advance, so the same snapshot is committed once
        // the repo is back.
        fake.set_down(false);
        assert!(publisher.publish_services(&next).await);
        assert_eq!(fake.version("/local/services"), Some(3));
        assert!(fake
            .file("/local/services/config/registry.json")
            .expect("registry must be committed")
            .contains("10.0.0.2:8080"));
    }

    #[tokio::test]
    async fn ingress_document_has_the_expected_keys() {
        let (fake, mut publisher, _) = mk_publisher().await;
        assert!(publisher.publish_ingress(&IngressSnapshot::new(vec![])).await);
        let doc: serde_json::Value = serde_json::from_str(
            &fake
                .file("/local/ingress/config/ingress.json")
                .expect("ingress must be committed"),
        )
        .expect("ingress must be json");
        let mut keys = doc
            .as_object()
            .expect("ingress must be an object")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        keys.sort();
        assert_eq!(keys, vec!["balancers", "certificates", "routes", "trustedCAs"]);
    }
}
