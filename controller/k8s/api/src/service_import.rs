use erie_canal_controller_core::ClusterKey;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The mirror of a service exported by other members of the cluster set.
///
/// Each port lists, per exporting cluster, the gateway endpoints through
/// which the service is reached.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "flomesh.io",
    version = "v1alpha1",
    kind = "ServiceImport",
    status = "ServiceImportStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceImportSpec {
    #[serde(rename = "type", default)]
    pub type_: ServiceImportType,

    #[serde(default)]
    pub ports: Vec<ServicePort>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_affinity: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ServiceImportType {
    #[default]
    ClusterSetIP,
    Headless,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,

    pub port: u16,

    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub cluster_key: String,
    pub target: Target,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, JsonSchema)]
pub struct Target {
    pub host: String,
    #[serde(default)]
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ServiceImportStatus {
    #[serde(default)]
    pub clusters: Vec<ClusterStatus>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ClusterStatus {
    pub cluster: String,
}

// === impl ServiceImportSpec ===

impl ServiceImportSpec {
    /// Replaces the endpoints contributed by `cluster` with those in `ports`.
    ///
    /// Ports are matched by number. Ports left without endpoints are removed.
    pub fn merge_cluster(&mut self, cluster: &ClusterKey, ports: Vec<ServicePort>) {
        let key = cluster.to_string();
        for port in self.ports.iter_mut() {
            port.endpoints.retain(|ep| ep.cluster_key != key);
        }

        for incoming in ports {
            let endpoints = incoming
                .endpoints
                .iter()
                .filter(|ep| ep.cluster_key == key)
                .cloned()
                .collect::<Vec<_>>();
            match self.ports.iter_mut().find(|p| p.port == incoming.port) {
                Some(port) => port.endpoints.extend(endpoints),
                None => self.ports.push(ServicePort {
                    endpoints,
                    ..incoming
                }),
            }
        }

        self.normalize();
    }

    /// Drops every endpoint contributed by `cluster`, returning true if any
    /// was removed.
    pub fn remove_cluster(&mut self, cluster: &ClusterKey) -> bool {
        let key = cluster.to_string();
        let before = self.endpoint_count();
        for port in self.ports.iter_mut() {
            port.endpoints.retain(|ep| ep.cluster_key != key);
        }
        self.normalize();
        before != self.endpoint_count()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.iter().all(|p| p.endpoints.is_empty())
    }

    /// The keys of all clusters contributing endpoints.
    pub fn clusters(&self) -> BTreeSet<String> {
        self.ports
            .iter()
            .flat_map(|p| p.endpoints.iter().map(|ep| ep.cluster_key.clone()))
            .collect()
    }

    fn endpoint_count(&self) -> usize {
        self.ports.iter().map(|p| p.endpoints.len()).sum()
    }

    fn normalize(&mut self) {
        self.ports.retain(|p| !p.endpoints.is_empty());
        for port in self.ports.iter_mut() {
            port.endpoints.sort();
            port.endpoints.dedup();
        }
        self.ports.sort_by_key(|p| p.port);
    }
}

// === impl ServiceImport ===

impl ServiceImport {
    /// The status listing the clusters that contribute endpoints.
    pub fn cluster_status(&self) -> ServiceImportStatus {
        ServiceImportStatus {
            clusters: self
                .spec
                .clusters()
                .into_iter()
                .map(|cluster| ClusterStatus { cluster })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn port(port: u16, cluster: &ClusterKey, paths: &[&str]) -> ServicePort {
        ServicePort {
            name: Some("http".to_string()),
            protocol: Some("TCP".to_string()),
            app_protocol: None,
            port,
            endpoints: paths
                .iter()
                .map(|path| Endpoint {
                    cluster_key: cluster.to_string(),
                    target: Target {
                        host: format!("gw.{}.example.com", cluster.name),
                        ip: String::new(),
                        port: 8091,
                        path: path.to_string(),
                    },
                })
                .collect(),
        }
    }

    #[test]
    fn merges_endpoints_per_cluster() {
        let a = ClusterKey::new("", "", "", "a");
        let c = ClusterKey::new("", "", "", "c");
        let mut spec = ServiceImportSpec::default();

        spec.merge_cluster(&a, vec![port(80, &a, &["/v1"])]);
        spec.merge_cluster(&c, vec![port(80, &c, &["/v1"])]);
        assert_eq!(spec.ports.len(), 1);
        assert_eq!(spec.ports[0].endpoints.len(), 2);
        assert_eq!(
            spec.clusters().into_iter().collect::<Vec<_>>(),
            vec![a.to_string(), c.to_string()]
        );

        // Re-merging replaces rather than appends.
        spec.merge_cluster(&a, vec![port(80, &a, &["/v2"])]);
        let paths = spec.ports[0]
            .endpoints
            .iter()
            .filter(|ep| ep.cluster_key == a.to_string())
            .map(|ep| ep.target.path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["/v2"]);
    }

    #[test]
    fn removing_the_last_cluster_empties_the_import() {
        let a = ClusterKey::new("", "", "", "a");
        let mut spec = ServiceImportSpec::default();
        spec.merge_cluster(&a, vec![port(80, &a, &["/v1"]), port(443, &a, &["/tls"])]);
        assert!(!spec.is_empty());

        assert!(spec.remove_cluster(&a));
        assert!(spec.is_empty());
        assert!(spec.ports.is_empty());
        assert!(!spec.remove_cluster(&a));
    }

    #[test]
    fn ignores_endpoints_of_other_clusters() {
        let a = ClusterKey::new("", "", "", "a");
        let b = ClusterKey::new("", "", "", "b");
        let mut spec = ServiceImportSpec::default();
        spec.merge_cluster(&a, vec![port(80, &b, &["/v1"])]);
        assert!(spec.is_empty());
    }
}
