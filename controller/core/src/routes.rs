//! Routing snapshots published to the proxy's script repository.
//!
//! Two independent artifacts are derived from a member cluster's state:
//!
//! - a [`ServiceSnapshot`], mapping each `namespace/name[:port]` to the set of
//!   addresses able to serve it (local endpoints, ExternalName targets and
//!   gateways of peer clusters that export the service); and
//! - an [`IngressSnapshot`], the host/path routing table with its balancing,
//!   TLS and upstream settings.
//!
//! Both snapshots are canonicalized on construction so that their hash only
//! depends on content, never on the order in which inputs were observed.

use crate::{stable_hash, ClusterKey};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

pub const TAG_NODE: &str = "Node";
pub const TAG_HOST: &str = "Host";
pub const TAG_CLUSTER: &str = "Cluster";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServicePortName {
    pub namespace: String,
    pub name: String,
    /// The service port's name; empty for unnamed ports.
    pub port: String,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Target {
    pub address: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRoute {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port_name: String,
    pub targets: Vec<Target>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceSnapshot {
    routes: Vec<ServiceRoute>,
    hash: String,
}

/// The `registry.json` document: service-port name to addresses.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistry {
    pub services: BTreeMap<String, Vec<String>>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Balancer {
    #[default]
    RoundRobinLoadBalancer,
    HashingLoadBalancer,
    LeastWorkLoadBalancer,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("unsupported load balancer type {0:?}")]
pub struct InvalidBalancer(String);

/// PEM material read from a TLS secret.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CertificateSpec {
    pub cert: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    pub is_tls: bool,
    pub is_wildcard_host: bool,
    pub verify_client: bool,
    pub verify_depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateSpec>,
    #[serde(rename = "trustedCA", skip_serializing_if = "Option::is_none")]
    pub trusted_ca: Option<CertificateSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cert: Option<CertificateSpec>,
    pub ssl_verify: bool,
}

/// A single host/path route of the ingress routing table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRoute {
    pub host: String,
    pub path: String,
    pub service: ServicePortName,
    /// `(from, to)` regular expression rewrite of the request path.
    pub rewrite: Option<(String, String)>,
    pub balancer: Balancer,
    pub sticky: bool,
    pub tls: Option<TlsSpec>,
    pub upstream: Option<UpstreamSpec>,
    /// `ip:port` addresses of the backing endpoints.
    pub upstream_endpoints: Vec<String>,
    /// Set when TLS is passed through to the upstream on this port instead of
    /// being terminated by the proxy.
    pub ssl_passthrough: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressSnapshot {
    routes: Vec<IngressRoute>,
    hash: String,
}

/// The `ingress.json` document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressConfig {
    pub routes: Vec<RouteRecord>,
    pub certificates: BTreeMap<String, TlsSpec>,
    #[serde(rename = "trustedCAs")]
    pub trusted_cas: Vec<String>,
    pub balancers: BTreeMap<String, BalancerRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRecord {
    pub host: String,
    pub path: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<(String, String)>,
    pub balancer: Balancer,
    pub sticky: bool,
    pub tls: bool,
    pub upstream_endpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_passthrough: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancerRecord {
    pub balancer: Balancer,
    pub sticky: bool,
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamSpec>,
}

// === impl ServicePortName ===

impl ServicePortName {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for ServicePortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)?;
        if !self.port.is_empty() {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

// === impl Target ===

impl Target {
    /// An endpoint of a local `ClusterIP` service.
    pub fn local(ip: &str, port: u16, node: &str, host: &str) -> Self {
        let tags = [
            (TAG_NODE.to_string(), node.to_string()),
            (TAG_HOST.to_string(), host.to_string()),
        ]
        .into_iter()
        .collect();
        Self {
            address: format!("{ip}:{port}"),
            tags,
        }
    }

    /// The resolved name of an `ExternalName` service.
    pub fn external(name: &str, port: u16) -> Self {
        Self {
            address: format!("{name}:{port}"),
            tags: BTreeMap::new(),
        }
    }

    /// A peer cluster's gateway serving an imported service.
    pub fn remote(host: &str, port: u16, path: &str, cluster: &ClusterKey) -> Self {
        Self {
            address: format!("{host}:{port}{path}"),
            tags: [(TAG_CLUSTER.to_string(), cluster.to_string())]
                .into_iter()
                .collect(),
        }
    }
}

// === impl ServiceRoute ===

impl ServiceRoute {
    pub fn service_port_name(&self) -> ServicePortName {
        ServicePortName::new(&self.namespace, &self.name, &self.port_name)
    }
}

// === impl ServiceSnapshot ===

impl ServiceSnapshot {
    pub fn new(mut routes: Vec<ServiceRoute>) -> Self {
        for route in routes.iter_mut() {
            route.targets.sort();
            route.targets.dedup();
        }
        routes.sort_by(|a, b| {
            (&a.namespace, &a.name, &a.port_name).cmp(&(&b.namespace, &b.name, &b.port_name))
        });
        let hash = stable_hash(&routes);
        Self { routes, hash }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn routes(&self) -> &[ServiceRoute] {
        &self.routes
    }

    pub fn get(&self, name: &ServicePortName) -> Option<&ServiceRoute> {
        self.routes.iter().find(|r| r.service_port_name() == *name)
    }

    pub fn registry(&self) -> ServiceRegistry {
        let mut services = BTreeMap::<String, Vec<String>>::new();
        for route in &self.routes {
            services
                .entry(route.service_port_name().to_string())
                .or_default()
                .extend(route.targets.iter().map(|t| t.address.clone()));
        }
        ServiceRegistry { services }
    }
}

// === impl Balancer ===

impl FromStr for Balancer {
    type Err = InvalidBalancer;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "RoundRobinLoadBalancer" | "round-robin" => Ok(Self::RoundRobinLoadBalancer),
            "HashingLoadBalancer" | "hashing" => Ok(Self::HashingLoadBalancer),
            "LeastWorkLoadBalancer" | "least-work" => Ok(Self::LeastWorkLoadBalancer),
            s => Err(InvalidBalancer(s.to_string())),
        }
    }
}

impl fmt::Display for Balancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundRobinLoadBalancer => "RoundRobinLoadBalancer".fmt(f),
            Self::HashingLoadBalancer => "HashingLoadBalancer".fmt(f),
            Self::LeastWorkLoadBalancer => "LeastWorkLoadBalancer".fmt(f),
        }
    }
}

// === impl IngressSnapshot ===

impl IngressSnapshot {
    /// Builds a snapshot, eliding routes that have no upstream endpoints.
    pub fn new(routes: Vec<IngressRoute>) -> Self {
        let mut routes = routes
            .into_iter()
            .filter_map(|mut route| {
                route.upstream_endpoints.sort();
                route.upstream_endpoints.dedup();
                if route.upstream_endpoints.is_empty() {
                    return None;
                }
                Some(route)
            })
            .collect::<Vec<_>>();
        routes.sort_by(|a, b| (&a.host, &a.path, &a.service).cmp(&(&b.host, &b.path, &b.service)));
        let hash = stable_hash(&routes);
        Self { routes, hash }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn routes(&self) -> &[IngressRoute] {
        &self.routes
    }

    pub fn config(&self) -> IngressConfig {
        let mut config = IngressConfig::default();
        for route in &self.routes {
            let service = route.service.to_string();
            let terminates_tls = route.ssl_passthrough.is_none()
                && route.tls.as_ref().map(|t| t.is_tls).unwrap_or(false);

            config.routes.push(RouteRecord {
                host: route.host.clone(),
                path: route.path.clone(),
                service: service.clone(),
                rewrite: route.rewrite.clone(),
                balancer: route.balancer,
                sticky: route.sticky,
                tls: terminates_tls,
                upstream_endpoints: route.upstream_endpoints.clone(),
                ssl_passthrough: route.ssl_passthrough,
            });

            if let Some(tls) = route.tls.as_ref().filter(|_| route.ssl_passthrough.is_none()) {
                if let Some(ca) = tls.trusted_ca.as_ref() {
                    let pem = if ca.ca.is_empty() { &ca.cert } else { &ca.ca };
                    if !pem.is_empty() {
                        config.trusted_cas.push(pem.clone());
                    }
                }
                if !route.host.is_empty() {
                    config
                        .certificates
                        .entry(route.host.clone())
                        .or_insert_with(|| tls.clone());
                }
            }

            config
                .balancers
                .entry(service)
                .or_insert_with(|| BalancerRecord {
                    balancer: route.balancer,
                    sticky: route.sticky,
                    targets: route.upstream_endpoints.clone(),
                    upstream: route.upstream.clone(),
                });
        }
        config.trusted_cas.sort();
        config.trusted_cas.dedup();
        config
    }
}
