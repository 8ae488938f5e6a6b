use ahash::AHashMap as HashMap;
use erie_canal_controller_core::{routes::Balancer, ResourceId};
use erie_canal_controller_k8s_api::{
    mesh_config::is_dns_1123_hostname, HTTPIngressPath, Ingress, IngressClass, IngressRule,
    IngressTLS, ResourceExt, Time,
};
use std::collections::{btree_map::Entry, BTreeMap};

pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
pub const DEFAULT_CLASS_ANNOTATION: &str = "ingressclass.kubernetes.io/is-default-class";

pub const ANNOTATION_PREFIX: &str = "pipy.ingress.kubernetes.io";
pub const REWRITE_FROM: &str = "pipy.ingress.kubernetes.io/rewrite-target-from";
pub const REWRITE_TO: &str = "pipy.ingress.kubernetes.io/rewrite-target-to";
pub const SESSION_STICKY: &str = "pipy.ingress.kubernetes.io/session-sticky";
pub const LOAD_BALANCER: &str = "pipy.ingress.kubernetes.io/lb-type";
pub const UPSTREAM_SSL_NAME: &str = "pipy.ingress.kubernetes.io/upstream-ssl-name";
pub const UPSTREAM_SSL_SECRET: &str = "pipy.ingress.kubernetes.io/upstream-ssl-secret";
pub const UPSTREAM_SSL_VERIFY: &str = "pipy.ingress.kubernetes.io/upstream-ssl-verify";
pub const TLS_VERIFY_CLIENT: &str = "pipy.ingress.kubernetes.io/tls-verify-client";
pub const TLS_VERIFY_DEPTH: &str = "pipy.ingress.kubernetes.io/tls-verify-depth";
pub const TLS_TRUSTED_CA_SECRET: &str = "pipy.ingress.kubernetes.io/tls-trusted-ca-secret";

const DEFAULT_VERIFY_DEPTH: u32 = 1;

/// Orders routes of the ingress table. Routes of different Ingresses may share
/// a host and path; the compiler resolves such collisions.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IngressKey {
    pub host: String,
    pub path: String,
    pub ingress: ResourceId,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BackendPort {
    Name(String),
    Number(u16),
}

/// A route declared by an Ingress rule, with its secret references still
/// unresolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeclaredRoute {
    pub created: Option<Time>,
    pub service: ResourceId,
    pub port: BackendPort,
    pub rewrite: Option<(String, String)>,
    pub balancer: Balancer,
    pub sticky: bool,
    pub tls: Option<TlsRef>,
    pub upstream: UpstreamRef,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsRef {
    pub secret: Option<ResourceId>,
    pub is_wildcard_host: bool,
    pub verify_client: bool,
    pub verify_depth: u32,
    pub trusted_ca: Option<ResourceId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpstreamRef {
    pub ssl_name: Option<String>,
    pub ssl_secret: Option<ResourceId>,
    pub ssl_verify: bool,
}

pub type IngressFragment = BTreeMap<IngressKey, DeclaredRoute>;

/// The cluster's ingress classes, by name, with their default flag.
#[derive(Debug, Default)]
pub struct IngressClasses {
    by_name: HashMap<String, bool>,
}

/// Settings extracted from an Ingress's annotations, shared by all its routes.
#[derive(Debug)]
struct Annotations {
    rewrite: Option<(String, String)>,
    balancer: Balancer,
    sticky: bool,
    upstream: UpstreamRef,
    verify_client: bool,
    verify_depth: u32,
    trusted_ca: Option<ResourceId>,
}

// === impl IngressClasses ===

impl IngressClasses {
    /// Returns true if the set of classes changed.
    pub(crate) fn apply(&mut self, class: &IngressClass) -> bool {
        let is_default = class
            .annotations()
            .get(DEFAULT_CLASS_ANNOTATION)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        self.by_name.insert(class.name_unchecked(), is_default) != Some(is_default)
    }

    pub(crate) fn delete(&mut self, name: &str) -> bool {
        self.by_name.remove(name).is_some()
    }

    fn default_class(&self) -> Option<&str> {
        let mut defaults = self
            .by_name
            .iter()
            .filter(|(_, is_default)| **is_default)
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>();
        defaults.sort_unstable();
        defaults.first().copied()
    }

    /// Returns true if `ingress` belongs to `class`.
    ///
    /// An Ingress without a class belongs to `class` when `class` is the
    /// cluster's default or when no default is configured.
    pub fn accepts(&self, ingress: &Ingress, class: &str) -> bool {
        let requested = ingress
            .annotations()
            .get(INGRESS_CLASS_ANNOTATION)
            .cloned()
            .or_else(|| {
                ingress
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.ingress_class_name.clone())
            })
            .unwrap_or_default();

        if requested.is_empty() {
            return match self.default_class() {
                None => true,
                Some(default) => default == class,
            };
        }
        requested == class
    }
}

// === impl IngressKey ===

impl IngressKey {
    /// The `(host, path)` pair that must be unique in the routing table.
    pub fn host_path(&self) -> (&str, &str) {
        (&self.host, &self.path)
    }
}

/// Derives the routes of an Ingress.
///
/// Secrets named by a single segment are looked up in
/// `controller_namespace`. Within one Ingress the first rule for a host and
/// path wins.
pub(crate) fn fragment(ingress: &Ingress, controller_namespace: &str) -> IngressFragment {
    let namespace = ingress.namespace().unwrap_or_default();
    let id = ResourceId::new(&namespace, ingress.name_unchecked());
    let Some(spec) = ingress.spec.as_ref() else {
        return IngressFragment::new();
    };

    let annotations = Annotations::parse(ingress, &id, controller_namespace);
    let tls = spec.tls.as_deref().unwrap_or_default();

    let mut fragment = IngressFragment::new();
    for rule in spec.rules.iter().flatten() {
        let Some(http) = rule.http.as_ref() else {
            continue;
        };
        let host = rule.host.clone().unwrap_or_default();

        for path in &http.paths {
            let Some((service, port)) = backend(&namespace, path) else {
                tracing::debug!(ingress = %id, path = ?path.path, "Skipping path without a service backend");
                continue;
            };
            let Some(route_path) = route_path(path) else {
                tracing::debug!(ingress = %id, path = ?path.path, "Skipping path with unsupported type");
                continue;
            };

            let key = IngressKey {
                host: host.clone(),
                path: route_path,
                ingress: id.clone(),
            };
            let entry = match fragment.entry(key) {
                Entry::Occupied(entry) => {
                    tracing::warn!(ingress = %id, host = %entry.key().host, path = %entry.key().path, "Duplicate route");
                    continue;
                }
                Entry::Vacant(entry) => entry,
            };

            let route_tls = if tls.is_empty() {
                None
            } else {
                Some(TlsRef {
                    secret: tls_secret(rule, tls).map(|name| ResourceId::new(&namespace, name)),
                    is_wildcard_host: is_wildcard_host(&host),
                    verify_client: annotations.verify_client,
                    verify_depth: annotations.verify_depth,
                    trusted_ca: annotations.trusted_ca.clone(),
                })
            };

            entry.insert(DeclaredRoute {
                created: ingress.metadata.creation_timestamp.clone(),
                service,
                port,
                rewrite: annotations.rewrite.clone(),
                balancer: annotations.balancer,
                sticky: annotations.sticky,
                tls: route_tls,
                upstream: annotations.upstream.clone(),
            });
        }
    }
    fragment
}

fn backend(namespace: &str, path: &HTTPIngressPath) -> Option<(ResourceId, BackendPort)> {
    let svc = path.backend.service.as_ref()?;
    let port = svc.port.as_ref()?;
    let port = match (port.name.as_deref(), port.number) {
        (Some(name), _) if !name.is_empty() => BackendPort::Name(name.to_string()),
        (_, Some(number)) if number > 0 => BackendPort::Number(u16::try_from(number).ok()?),
        _ => return None,
    };
    Some((ResourceId::new(namespace, &svc.name), port))
}

fn route_path(path: &HTTPIngressPath) -> Option<String> {
    convert_path(path.path.as_deref().unwrap_or("/"), &path.path_type)
}

/// Converts an Ingress path to the proxy's path syntax.
///
/// Exact paths are literal. Prefix paths match every subpath: `/api` becomes
/// `/api/*`, `/api/` becomes `/api/*`.
pub fn convert_path(path: &str, path_type: &str) -> Option<String> {
    match path_type {
        "Exact" => Some(path.to_string()),
        "Prefix" if path.ends_with("/*") => Some(path.to_string()),
        "Prefix" if path.ends_with('/') => Some(format!("{path}*")),
        "Prefix" => Some(format!("{path}/*")),
        _ => None,
    }
}

/// Picks the TLS secret for a rule: the entry listing the rule's host, or
/// else the first entry with a secret.
fn tls_secret<'t>(rule: &IngressRule, tls: &'t [IngressTLS]) -> Option<&'t str> {
    let host = rule.host.as_deref().unwrap_or_default().to_ascii_lowercase();
    let by_host = tls.iter().find(|t| {
        t.hosts
            .iter()
            .flatten()
            .any(|h| h.to_ascii_lowercase() == host)
    });
    by_host
        .or_else(|| tls.iter().find(|t| t.secret_name.is_some()))
        .and_then(|t| t.secret_name.as_deref())
        .filter(|name| !name.is_empty())
}

pub fn is_wildcard_host(host: &str) -> bool {
    host.strip_prefix("*.")
        .map(is_dns_1123_hostname)
        .unwrap_or(false)
}

/// Parses the annotation boolean syntax. Unset is false.
pub fn parse_bool(value: Option<&str>) -> Result<bool, String> {
    match value.map(str::to_ascii_lowercase).as_deref() {
        None | Some("" | "no" | "false" | "0" | "off") => Ok(false),
        Some("yes" | "true" | "1" | "on") => Ok(true),
        Some(other) => Err(other.to_string()),
    }
}

/// Parses a `[namespace/]name` secret reference.
fn secret_ref(value: &str, default_namespace: &str) -> Option<ResourceId> {
    match value.split('/').collect::<Vec<_>>().as_slice() {
        [name] if !name.is_empty() => Some(ResourceId::new(default_namespace, *name)),
        [ns, name] if !name.is_empty() => Some(ResourceId::new(*ns, *name)),
        _ => None,
    }
}

// === impl Annotations ===

impl Annotations {
    fn parse(ingress: &Ingress, id: &ResourceId, controller_namespace: &str) -> Self {
        let annotations = ingress.annotations();
        let get = |key: &str| annotations.get(key).map(String::as_str);
        let flag = |key: &str| {
            parse_bool(get(key)).unwrap_or_else(|value| {
                tracing::warn!(ingress = %id, annotation = key, %value, "Invalid boolean; using false");
                false
            })
        };
        let secret = |key: &str| {
            let value = get(key).filter(|v| !v.is_empty())?;
            let secret = secret_ref(value, controller_namespace);
            if secret.is_none() {
                tracing::error!(ingress = %id, annotation = key, %value, "Invalid secret reference");
            }
            secret
        };

        let rewrite = match (get(REWRITE_FROM), get(REWRITE_TO)) {
            (Some(from), Some(to)) if !from.is_empty() && !to.is_empty() => {
                Some((from.to_string(), to.to_string()))
            }
            _ => None,
        };

        let balancer = get(LOAD_BALANCER)
            .unwrap_or_default()
            .parse::<Balancer>()
            .unwrap_or_else(|error| {
                tracing::error!(ingress = %id, %error, "Using the default load balancer");
                Balancer::default()
            });

        let verify_depth = match get(TLS_VERIFY_DEPTH).filter(|v| !v.is_empty()) {
            None => DEFAULT_VERIFY_DEPTH,
            Some(v) => v.parse().unwrap_or_else(|_| {
                tracing::warn!(ingress = %id, value = %v, "Invalid TLS verify depth; using 1");
                DEFAULT_VERIFY_DEPTH
            }),
        };

        Self {
            rewrite,
            balancer,
            sticky: flag(SESSION_STICKY),
            upstream: UpstreamRef {
                ssl_name: get(UPSTREAM_SSL_NAME)
                    .filter(|v| !v.is_empty())
                    .map(Into::into),
                ssl_secret: secret(UPSTREAM_SSL_SECRET),
                ssl_verify: flag(UPSTREAM_SSL_VERIFY),
            },
            verify_client: flag(TLS_VERIFY_CLIENT),
            verify_depth,
            trusted_ca: secret(TLS_TRUSTED_CA_SECRET),
        }
    }
}
