use crate::Condition;
use erie_canal_controller_core::{stable_hash, ClusterKey};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_GATEWAY_PORT: u16 = 80;

/// A member of the cluster set.
///
/// Exactly one Cluster per cluster set describes the home cluster
/// (`isInCluster: true`); every other Cluster carries the kubeconfig used to
/// reach that peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "flomesh.io",
    version = "v1alpha1",
    kind = "Cluster",
    status = "ClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub is_in_cluster: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// The FQDN or IPv4 address peers use to reach this cluster's exports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_port: Option<u16>,

    /// Required for peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ClusterStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// === impl Cluster ===

impl Cluster {
    pub fn key(&self) -> ClusterKey {
        self.spec.key(&self.name_any())
    }

    /// A content hash of the spec. Connectors are restarted when it changes.
    pub fn spec_hash(&self) -> String {
        stable_hash(&self.spec)
    }

    pub fn is_managed(&self) -> bool {
        self.status
            .iter()
            .flat_map(|s| s.conditions.iter())
            .any(|c| c.type_ == "Managed" && c.status == "True")
    }
}

// === impl ClusterSpec ===

impl ClusterSpec {
    pub fn key(&self, name: &str) -> ClusterKey {
        let s = |v: &Option<String>| v.clone().unwrap_or_default();
        ClusterKey::new(s(&self.region), s(&self.zone), s(&self.group), name)
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway_port.unwrap_or(DEFAULT_GATEWAY_PORT)
    }
}
