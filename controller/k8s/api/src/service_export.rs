use crate::Condition;
use erie_canal_controller_core::{
    export::{self, ExportShape},
    routes::Balancer,
    ClusterKey,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU16;

pub const CONDITION_VALID: &str = "Valid";
pub const CONDITION_CONFLICT: &str = "Conflict";

/// Declares that the Service of the same namespace and name is reachable from
/// the other members of the cluster set.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "flomesh.io",
    version = "v1alpha1",
    kind = "ServiceExport",
    status = "ServiceExportStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExportSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_rewrite: Option<PathRewrite>,

    #[serde(default)]
    pub session_sticky: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancer>,

    pub rules: Vec<ServiceExportRule>,

    /// Keys (`region/zone/group/name`) of the clusters that may import the
    /// service. All members may import it when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_clusters: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExportRule {
    pub port_number: NonZeroU16,
    pub path: String,
    pub path_type: PathType,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum PathType {
    Exact,
    Prefix,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct PathRewrite {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum LoadBalancer {
    RoundRobinLoadBalancer,
    HashingLoadBalancer,
    LeastWorkLoadBalancer,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ServiceExportStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// === impl ServiceExport ===

impl ServiceExport {
    fn condition_is(&self, type_: &str, status: &str) -> bool {
        self.status
            .iter()
            .flat_map(|s| s.conditions.iter())
            .any(|c| c.type_ == type_ && c.status == status)
    }

    /// True once validation in the owning cluster has rejected the export.
    pub fn is_invalid(&self) -> bool {
        self.condition_is(CONDITION_VALID, "False")
    }

    pub fn is_valid(&self) -> bool {
        self.condition_is(CONDITION_VALID, "True")
    }

    pub fn is_conflicting(&self) -> bool {
        self.condition_is(CONDITION_CONFLICT, "True")
    }

    /// True once the cluster set has accepted the export.
    pub fn is_accepted(&self) -> bool {
        self.is_valid() && self.condition_is(CONDITION_CONFLICT, "False")
    }
}

// === impl ServiceExportSpec ===

impl ServiceExportSpec {
    pub fn shape(&self) -> ExportShape {
        ExportShape::new(
            self.rules
                .iter()
                .map(|r| (r.port_number.get(), r.path.clone(), r.path_type.into())),
        )
    }

    pub fn balancer(&self) -> Balancer {
        self.load_balancer.map(Into::into).unwrap_or_default()
    }

    /// Returns true if `cluster` may import this export.
    pub fn targets(&self, cluster: &ClusterKey) -> bool {
        self.target_clusters.is_empty()
            || self
                .target_clusters
                .iter()
                .any(|t| t.parse::<ClusterKey>().ok().as_ref() == Some(cluster))
    }
}

impl From<PathType> for export::PathType {
    fn from(pt: PathType) -> Self {
        match pt {
            PathType::Exact => Self::Exact,
            PathType::Prefix => Self::Prefix,
        }
    }
}

impl From<LoadBalancer> for Balancer {
    fn from(lb: LoadBalancer) -> Self {
        match lb {
            LoadBalancer::RoundRobinLoadBalancer => Self::RoundRobinLoadBalancer,
            LoadBalancer::HashingLoadBalancer => Self::HashingLoadBalancer,
            LoadBalancer::LeastWorkLoadBalancer => Self::LeastWorkLoadBalancer,
        }
    }
}
