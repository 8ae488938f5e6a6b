//! Connectors observe one member cluster each.
//!
//! The connector for the home cluster (`isInCluster`) maintains the local
//! routing tables, validates the cluster's own ServiceExports and publishes
//! snapshots to the repo. Every other connector watches a peer cluster's
//! exports, forwards them to the federation reconciler through the broker
//! and applies the resulting ServiceImports to the peer.

mod derived;
mod exports;
mod imports;
mod local;
mod remote;

use crate::{
    broker::Broker,
    clusters::SharedClusters,
    core::{export::Conflict, ClusterInfo, ClusterKey, ResourceId},
    index::{ExportIndex, SharedExportIndex},
    k8s::{self, api::apps::v1::Deployment, Cluster, MeshConfig, ServiceExport},
    lease::Leadership,
    publish::PublishMetrics,
    status,
};
use anyhow::{bail, ensure, Context as _, Result};
use futures::future::BoxFuture;
use kube::config::{KubeConfigOptions, Kubeconfig};
use std::{net::Ipv4Addr, sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};
use tracing::{info_span, Instrument};

/// The oldest API server a connector can manage.
const MIN_KUBERNETES_VERSION: (u32, u32) = (1, 19);

#[derive(Clone, Debug)]
pub struct Settings {
    pub controller_namespace: String,
    pub manager_deployment_name: String,
    pub mesh_config_name: String,
    pub ingress_class: String,
    pub resync_period: Duration,
}

/// Capabilities shared by every connector.
#[derive(Clone)]
pub struct Context {
    pub settings: Arc<Settings>,
    pub home: k8s::Client,
    pub broker: Broker,
    pub status: mpsc::Sender<status::Update>,
    pub mesh: watch::Receiver<Arc<MeshConfig>>,
    pub leadership: Leadership,
    pub clusters: SharedClusters,
    pub ready: Arc<watch::Sender<bool>>,
    pub publish_metrics: PublishMetrics,
}

/// The reconciler's view of a running connector.
#[async_trait::async_trait]
pub trait Peer: Send + Sync {
    fn info(&self) -> &ClusterInfo;

    /// True if the service is already a member of the cluster set from this
    /// cluster's point of view.
    fn service_import_exists(&self, id: &ResourceId) -> bool;

    /// Checks `export` against the export of the same service accepted in
    /// this cluster, if any.
    fn validate_export(&self, export: &ServiceExport) -> Result<(), Conflict>;

    /// Drops the endpoints contributed by `cluster` from this cluster's
    /// ServiceImports.
    async fn remove_cluster_endpoints(&self, cluster: &ClusterKey);
}

pub struct Launched {
    pub peer: Arc<dyn Peer>,
    /// Runs the connector until shutdown. Completes with an error if the
    /// connector fails.
    pub task: BoxFuture<'static, Result<()>>,
}

#[async_trait::async_trait]
pub trait Launch: Send + Sync {
    async fn launch(&self, cluster: &Cluster, shutdown: drain::Watch) -> Result<Launched>;
}

/// Starts connectors against real clusters.
pub struct Launcher {
    ctx: Context,
}

/// A member cluster, backed by its API server and export index.
struct Member {
    info: ClusterInfo,
    client: k8s::Client,
    exports: SharedExportIndex,
    leadership: Leadership,
}

// === impl Launcher ===

impl Launcher {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl Launch for Launcher {
    async fn launch(&self, cluster: &Cluster, shutdown: drain::Watch) -> Result<Launched> {
        let mesh = (*self.ctx.mesh.borrow()).clone();
        let in_cluster = cluster.spec.is_in_cluster;
        let client = if in_cluster {
            self.ctx.home.clone()
        } else {
            remote_client(cluster).await?
        };
        let info = cluster_info(cluster, &mesh).await?;

        check_version(&client).await?;
        check_manager(&client, &self.ctx.settings).await?;
        if !in_cluster {
            remote::join(&client, &self.ctx.settings, &info, &self.ctx.leadership).await?;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let exports = ExportIndex::shared(events_tx.clone());
        let member = Arc::new(Member {
            info: info.clone(),
            client: client.clone(),
            exports: exports.clone(),
            leadership: self.ctx.leadership.clone(),
        });

        let span = info_span!("connector", cluster = %info.key);
        let task = if in_cluster {
            let local = local::Local {
                ctx: self.ctx.clone(),
                info,
                client,
                exports,
                events_tx,
            };
            Box::pin(local.run(events_rx, shutdown).instrument(span)) as BoxFuture<'static, _>
        } else {
            let remote = remote::Remote {
                ctx: self.ctx.clone(),
                info,
                client,
                exports,
            };
            Box::pin(remote.run(events_rx, shutdown).instrument(span))
        };

        Ok(Launched { peer: member, task })
    }
}

// === impl Member ===

#[async_trait::async_trait]
impl Peer for Member {
    fn info(&self) -> &ClusterInfo {
        &self.info
    }

    fn service_import_exists(&self, id: &ResourceId) -> bool {
        self.exports.read().service_import_exists(id)
    }

    fn validate_export(&self, export: &ServiceExport) -> Result<(), Conflict> {
        let id = resource_id(export);
        let exports = self.exports.read();
        match exports.accepted_export(&id) {
            Some(accepted) => export
                .spec
                .shape()
                .check_compatible(&accepted.spec.shape(), &self.info.key),
            None => Ok(()),
        }
    }

    async fn remove_cluster_endpoints(&self, cluster: &ClusterKey) {
        if !self.leadership.is_leader() {
            return;
        }
        if let Err(error) = imports::remove_cluster(&self.client, cluster).await {
            tracing::warn!(cluster = %self.info.key, removed = %cluster, %error, "Failed to remove endpoints");
        }
    }
}

// === helpers ===

pub(crate) fn resource_id<T: k8s::ResourceExt>(resource: &T) -> ResourceId {
    ResourceId::new(resource.namespace().unwrap_or_default(), resource.name_unchecked())
}

/// Describes how peers reach `cluster`.
///
/// The home cluster is identified by the MeshConfig rather than by its
/// Cluster resource, and carries no control plane UID.
async fn cluster_info(cluster: &Cluster, mesh: &MeshConfig) -> Result<ClusterInfo> {
    let spec = &cluster.spec;
    let (key, control_plane_uid) = if spec.is_in_cluster {
        (mesh.cluster_key(), String::new())
    } else {
        (cluster.key(), mesh.cluster.uid.clone())
    };

    let gateway_host = spec.gateway_host.clone().unwrap_or_default();
    let gateway_port = spec.gateway_port();
    let gateway_ip = if gateway_host.is_empty() {
        None
    } else {
        Some(resolve_ipv4(&gateway_host, gateway_port).await?)
    };

    Ok(ClusterInfo {
        key,
        gateway_host,
        gateway_ip,
        gateway_port,
        in_cluster: spec.is_in_cluster,
        control_plane_uid,
    })
}

async fn resolve_ipv4(host: &str, port: u16) -> Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve gateway host {host}"))?;
    for addr in addrs {
        if let std::net::SocketAddr::V4(addr) = addr {
            return Ok(*addr.ip());
        }
    }
    bail!("gateway host {host} has no IPv4 address")
}

async fn remote_client(cluster: &Cluster) -> Result<k8s::Client> {
    let kubeconfig = cluster
        .spec
        .kubeconfig
        .as_deref()
        .filter(|k| !k.is_empty())
        .context("kubeconfig is required for clusters other than the home cluster")?;
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig).context("failed to parse kubeconfig")?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("failed to load kubeconfig")?;
    k8s::Client::try_from(config).context("failed to build client")
}

pub(crate) async fn check_version(client: &k8s::Client) -> Result<()> {
    let info = client
        .apiserver_version()
        .await
        .context("failed to get the API server version")?;
    let version = parse_version(&info.major, &info.minor)
        .with_context(|| format!("unexpected API server version {}.{}", info.major, info.minor))?;
    ensure!(
        version >= MIN_KUBERNETES_VERSION,
        "Kubernetes {}.{} is not supported, at least {}.{} is required",
        version.0,
        version.1,
        MIN_KUBERNETES_VERSION.0,
        MIN_KUBERNETES_VERSION.1,
    );
    Ok(())
}

/// Parses a version such as `1` `27+`, ignoring vendor suffixes.
fn parse_version(major: &str, minor: &str) -> Option<(u32, u32)> {
    fn digits(s: &str) -> Option<u32> {
        let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        s[..end].parse().ok()
    }
    Some((digits(major)?, digits(minor)?))
}

/// The cluster must run its own manager for the connector to drive it.
async fn check_manager(client: &k8s::Client, settings: &Settings) -> Result<()> {
    let api = k8s::Api::<Deployment>::namespaced(client.clone(), &settings.controller_namespace);
    api.get(&settings.manager_deployment_name)
        .await
        .with_context(|| {
            format!(
                "Deployment {}/{} not found",
                settings.controller_namespace, settings.manager_deployment_name
            )
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        k8s::{ClusterSpec, ServiceExportSpec},
        tests::{accepted, mk_client, mk_export, mk_info},
    };
    use kubert::index::IndexNamespacedResource;
    use tokio::sync::mpsc;

    #[test]
    fn parses_vendor_versions() {
        assert_eq!(parse_version("1", "27+"), Some((1, 27)));
        assert_eq!(parse_version("1", "19"), Some((1, 19)));
        assert_eq!(parse_version("", "19"), None);
        assert!(parse_version("1", "18").unwrap() < MIN_KUBERNETES_VERSION);
    }

    #[tokio::test]
    async fn home_cluster_is_keyed_by_mesh_config() {
        let mut mesh = MeshConfig::default();
        mesh.cluster.name = "home".to_string();
        mesh.cluster.region = "east".to_string();
        mesh.cluster.uid = "uid-0".to_string();

        let home = Cluster::new(
            "anything",
            ClusterSpec {
                is_in_cluster: true,
                ..ClusterSpec::default()
            },
        );
        let info = cluster_info(&home, &mesh).await.unwrap();
        assert_eq!(info.key.to_string(), "east/default/default/home");
        assert_eq!(info.gateway_ip, None);
        assert!(info.control_plane_uid.is_empty());

        let peer = Cluster::new(
            "c1",
            ClusterSpec {
                gateway_host: Some("10.0.0.9".to_string()),
                gateway_port: Some(8091),
                ..ClusterSpec::default()
            },
        );
        let info = cluster_info(&peer, &mesh).await.unwrap();
        assert_eq!(info.key.to_string(), "default/default/default/c1");
        assert_eq!(info.gateway_ip, Some(Ipv4Addr::new(10, 0, 0, 9)));
        assert_eq!(info.gateway_addr(), "10.0.0.9:8091");
        assert_eq!(info.control_plane_uid, "uid-0");
    }

    #[tokio::test]
    async fn remote_client_requires_kubeconfig() {
        let cluster = Cluster::new("c1", ClusterSpec::default());
        let error = remote_client(&cluster).await.err().expect("must fail");
        assert!(error.to_string().contains("kubeconfig is required"));
    }

    #[tokio::test]
    async fn member_validates_against_accepted_exports() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let exports = ExportIndex::shared(tx);
        let key = ClusterKey::new("", "", "", "c1");
        let member = Member {
            info: mk_info("c1"),
            client: mk_client(),
            exports: exports.clone(),
            leadership: Leadership::fixed(true),
        };
        let id = ResourceId::new("demo", "api");
        let export = mk_export("demo", "api", &[(80, "/api")]);
        assert!(member.validate_export(&export).is_ok());
        assert!(!member.service_import_exists(&id));

        exports.write().apply(accepted(export.clone()));
        assert!(member.service_import_exists(&id));
        assert!(member.validate_export(&export).is_ok());

        let other = mk_export("demo", "api", &[(8080, "/api")]);
        let error = member.validate_export(&other).unwrap_err();
        assert!(matches!(error, Conflict::Ports { cluster, .. } if cluster == key));

        let unrelated = ServiceExport::new("web", ServiceExportSpec::default());
        assert!(member.validate_export(&unrelated).is_ok());
    }
}
