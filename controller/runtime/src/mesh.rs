//! Tracks the MeshConfig of the home cluster.
//!
//! Listener settings are also mirrored into the ingress base codebase's
//! `main.json`, which every derived ingress codebase inherits.

use crate::{
    core::DEFAULT_INGRESS_BASE_PATH,
    k8s::{self, watcher, ConfigMap, MeshConfig},
    lease::Leadership,
    repo::{self, Batch},
};
use anyhow::{bail, Context as _, Result};
use futures::prelude::*;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn};

const MAIN_CONFIG_DIR: &str = "/config";
const MAIN_CONFIG_FILE: &str = "main.json";

/// Reads and validates the MeshConfig stored in `ns/name`.
pub async fn load(client: &k8s::Client, ns: &str, name: &str) -> Result<MeshConfig> {
    let api = k8s::Api::<ConfigMap>::namespaced(client.clone(), ns);
    let cm = api
        .get(name)
        .await
        .with_context(|| format!("failed to get MeshConfig ConfigMap {ns}/{name}"))?;
    MeshConfig::from_config_map(&cm).with_context(|| format!("invalid MeshConfig {ns}/{name}"))
}

pub struct MeshWatch {
    pub client: k8s::Client,
    pub namespace: String,
    pub name: String,
    pub config: watch::Sender<Arc<MeshConfig>>,
    pub leadership: Leadership,
}

// === impl MeshWatch ===

impl MeshWatch {
    pub async fn run(self, shutdown: drain::Watch) {
        let api = k8s::Api::<ConfigMap>::namespaced(self.client.clone(), &self.namespace);
        let cfg = watcher::Config::default().fields(&format!("metadata.name={}", self.name));
        let events = k8s::watch(api, cfg, info_span!("mesh_config"));
        tokio::pin!(events);

        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);
        loop {
            let event = tokio::select! {
                biased;
                _ = &mut shutdown => return,
                event = events.next() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            match event {
                watcher::Event::Apply(cm) | watcher::Event::InitApply(cm) => self.apply(&cm).await,
                watcher::Event::Delete(_) => {
                    warn!(name = %self.name, "MeshConfig deleted; keeping the last configuration")
                }
                watcher::Event::Init | watcher::Event::InitDone => {}
            }
        }
    }

    async fn apply(&self, cm: &ConfigMap) {
        let next = match MeshConfig::from_config_map(cm) {
            Ok(config) => config,
            Err(error) => {
                warn!(%error, "Ignoring invalid MeshConfig");
                return;
            }
        };
        let prev = self.config.borrow().clone();
        if *prev == next {
            debug!("MeshConfig unchanged");
            return;
        }

        if prev.ingress != next.ingress && self.leadership.is_leader() {
            if let Err(error) = update_listeners(&next).await {
                warn!(error = %format_args!("{error:#}"), "Failed to update ingress listeners");
            }
        }
        if prev.certificate.manager != next.certificate.manager {
            match next.certificate_manager() {
                Ok(manager) => info!(%manager, "Certificate manager changed"),
                Err(error) => warn!(%error, "Unsupported certificate manager"),
            }
        }

        info!("MeshConfig updated");
        self.config.send_replace(Arc::new(next));
    }
}

async fn update_listeners(mesh: &MeshConfig) -> Result<()> {
    let repo = repo::Client::new(mesh.repo_root_url())?;
    let path = format!("{DEFAULT_INGRESS_BASE_PATH}{MAIN_CONFIG_DIR}/{MAIN_CONFIG_FILE}");
    let raw = repo.get(&path).await?;
    let mut main = serde_json::from_str::<serde_json::Value>(&raw)
        .with_context(|| format!("{path} is not JSON"))?;
    set_listeners(&mut main, mesh)?;

    let batch = Batch::new(DEFAULT_INGRESS_BASE_PATH).with_item(
        MAIN_CONFIG_DIR,
        MAIN_CONFIG_FILE,
        serde_json::to_string_pretty(&main)?,
    );
    repo.batch(&[batch]).await?;
    info!(%path, "Updated ingress listeners");
    Ok(())
}

/// Overwrites the listener settings of a `main.json` document, leaving the
/// rest of it untouched.
fn set_listeners(main: &mut serde_json::Value, mesh: &MeshConfig) -> Result<()> {
    if !main.is_object() {
        bail!("{MAIN_CONFIG_FILE} must be a JSON object");
    }
    let http = &mesh.ingress.http;
    main["http"] = serde_json::json!({
        "enabled": http.enabled,
        "listen": http.listen,
    });

    let tls = &mesh.ingress.tls;
    if !main["tls"].is_object() {
        main["tls"] = serde_json::json!({});
    }
    main["tls"]["enabled"] = tls.enabled.into();
    main["tls"]["listen"] = tls.listen.into();
    main["tls"]["mTLS"] = tls.mtls.into();

    main["sslPassthrough"] = serde_json::json!({
        "enabled": tls.ssl_passthrough.enabled,
        "upstreamPort": tls.ssl_passthrough.upstream_port,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        repo::fake::FakeRepo,
        tests::{mesh_config_json, mk_client, mk_mesh_config_map},
    };
    use pretty_assertions::assert_eq;

    #[test]
    fn listeners_keep_other_settings() {
        let mut main = serde_json::json!({
            "listen": 8000,
            "tls": { "certificates": { "cert": "x" }, "enabled": false },
            "plugins": ["router"],
        });
        let mesh = serde_json::from_value::<MeshConfig>(mesh_config_json("http://repo:6060"))
            .expect("config must parse");
        set_listeners(&mut main, &mesh).expect("main.json must be an object");

        assert_eq!(
            main,
            serde_json::json!({
                "listen": 8000,
                "http": { "enabled": true, "listen": 8000 },
                "tls": {
                    "certificates": { "cert": "x" },
                    "enabled": true,
                    "listen": 8443,
                    "mTLS": false,
                },
                "sslPassthrough": { "enabled": false, "upstreamPort": 443 },
                "plugins": ["router"],
            })
        );

        let mut array = serde_json::json!([]);
        assert!(set_listeners(&mut array, &mesh).is_err());
    }

    fn mk_watch(url: &str, leader: bool) -> (MeshWatch, watch::Receiver<Arc<MeshConfig>>) {
        let initial = serde_json::from_value::<MeshConfig>(mesh_config_json(url))
            .expect("config must parse");
        let (config, rx) = watch::channel(Arc::new(initial));
        let mesh = MeshWatch {
            client: mk_client(),
            namespace: "erie-canal".to_string(),
            name: "erie-canal-mesh-config".to_string(),
            config,
            leadership: Leadership::fixed(leader),
        };
        (mesh, rx)
    }

    #[tokio::test]
    async fn listener_changes_reach_the_ingress_codebase() {
        let (fake, url) = FakeRepo::spawn().await;
        fake.seed(
            DEFAULT_INGRESS_BASE_PATH,
            &[("/config/main.json", r#"{"plugins": ["router"]}"#)],
        );
        let (mesh, rx) = mk_watch(&url, true);

        let mut json = mesh_config_json(&url);
        json["ingress"]["http"]["listen"] = 9000.into();
        mesh.apply(&mk_mesh_config_map(&json)).await;

        assert_eq!(rx.borrow().ingress.http.listen, 9000);
        let main = serde_json::from_str::<serde_json::Value>(
            &fake
                .file("/base/ingress/config/main.json")
                .expect("main.json must be committed"),
        )
        .expect("main.json must be JSON");
        assert_eq!(main["http"]["listen"], 9000);
        assert_eq!(main["plugins"], serde_json::json!(["router"]));
    }

    #[tokio::test]
    async fn followers_only_track_the_config() {
        let (fake, url) = FakeRepo::spawn().await;
        fake.seed(DEFAULT_INGRESS_BASE_PATH, &[("/config/main.json", "{}")]);
        let (mesh, rx) = mk_watch(&url, false);

        let mut json = mesh_config_json(&url);
        json["ingress"]["http"]["listen"] = 9000.into();
        mesh.apply(&mk_mesh_config_map(&json)).await;

        assert_eq!(rx.borrow().ingress.http.listen, 9000);
        assert_eq!(fake.version(DEFAULT_INGRESS_BASE_PATH), Some(1));
    }

    #[tokio::test]
    async fn invalid_configs_are_ignored() {
        let (mesh, rx) = mk_watch("http://repo:6060", true);
        let mut json = mesh_config_json("http://repo:6060");
        json["repo"]["rootURL"] = "".into();
        mesh.apply(&mk_mesh_config_map(&json)).await;
        assert_eq!(rx.borrow().repo_root_url(), "http://repo:6060");
    }
}
