//! The control plane's singleton configuration.
//!
//! The configuration is stored as JSON under [`MESH_CONFIG_KEY`] in a
//! ConfigMap of the control plane namespace.

use crate::ConfigMap;
use erie_canal_controller_core::ClusterKey;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub const MESH_CONFIG_KEY: &str = "mesh_config.json";

const DEFAULT_SERVICES_PATH: &str = "/local/services";
const DEFAULT_INGRESS_PATH: &str = "/local/ingress";

const DNS_1123_HOSTNAME_MAX_LEN: usize = 253;

// Labels are at most 63 characters long.
const DNS_1123_HOSTNAME_REGEX: &str =
    r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?(\.[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?)*$";

lazy_static! {
    static ref DNS_1123_HOSTNAME: Regex =
        Regex::new(DNS_1123_HOSTNAME_REGEX).expect("hostname regex must compile");
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshConfig {
    #[serde(default)]
    pub is_managed: bool,
    pub repo: Repo,
    pub images: Images,
    pub webhook: Webhook,
    #[serde(default)]
    pub ingress: Ingress,
    #[serde(default)]
    pub gateway_api: GatewayApi,
    #[serde(default)]
    pub certificate: Certificate,
    pub cluster: Cluster,
    #[serde(default, rename = "serviceLB")]
    pub service_lb: ServiceLb,
    #[serde(default)]
    pub features_gate: FeaturesGate,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Repo {
    #[serde(rename = "rootURL")]
    pub root_url: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Images {
    pub repository: String,
    pub pipy_image: String,
    pub proxy_init_image: String,
    pub klipper_lb_image: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub service_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ingress {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub namespaced: bool,
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub tls: Tls,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Http {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bind: u32,
    #[serde(default)]
    pub listen: u32,
    #[serde(default)]
    pub node_port: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bind: u32,
    #[serde(default)]
    pub listen: u32,
    #[serde(default)]
    pub node_port: u32,
    #[serde(default, rename = "mTLS")]
    pub mtls: bool,
    #[serde(default)]
    pub ssl_passthrough: SslPassthrough,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SslPassthrough {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub upstream_port: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GatewayApi {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    #[serde(default)]
    pub manager: String,
    #[serde(default)]
    pub ca_bundle_name: String,
    #[serde(default)]
    pub ca_bundle_namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "controlPlaneUID")]
    pub control_plane_uid: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceLb {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesGate {
    /// Creates a `ClusterIP` Service for every `ClusterSetIP` ServiceImport.
    #[serde(default, rename = "createServiceAndEndpointSlicesForMCS")]
    pub create_service_for_mcs: bool,
}

/// The certificate manager backing TLS material issuance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CertificateManager {
    Manual,
    Archon,
    CertManager,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum Invalid {
    #[error("ConfigMap has no {0} key")]
    MissingKey(&'static str),

    #[error("failed to parse {MESH_CONFIG_KEY}: {0}")]
    Parse(String),

    #[error("{field} is required")]
    Required { field: &'static str },

    #[error("{field} must be a valid URL: {value:?}")]
    Url { field: &'static str, value: String },

    #[error("{field} must be a DNS-1123 hostname: {value:?}")]
    Hostname { field: &'static str, value: String },

    #[error("{field} must be within [{min}, 65535]: {value}")]
    Port {
        field: &'static str,
        value: u32,
        min: u32,
    },

    #[error("unsupported certificate manager {0:?}")]
    CertificateManager(String),
}

// === impl MeshConfig ===

impl MeshConfig {
    /// Parses and validates the configuration held by `cm`.
    pub fn from_config_map(cm: &ConfigMap) -> Result<Self, Invalid> {
        let json = cm
            .data
            .as_ref()
            .and_then(|d| d.get(MESH_CONFIG_KEY))
            .ok_or(Invalid::MissingKey(MESH_CONFIG_KEY))?;
        json.parse()
    }

    pub fn validate(&self) -> Result<(), Invalid> {
        if self.repo.root_url.is_empty() {
            return Err(Invalid::Required {
                field: "repo.rootURL",
            });
        }
        if url::Url::parse(&self.repo.root_url).is_err() {
            return Err(Invalid::Url {
                field: "repo.rootURL",
                value: self.repo.root_url.clone(),
            });
        }

        for (field, value) in [
            ("images.repository", &self.images.repository),
            ("images.pipyImage", &self.images.pipy_image),
            ("images.proxyInitImage", &self.images.proxy_init_image),
            ("images.klipperLbImage", &self.images.klipper_lb_image),
            ("webhook.serviceName", &self.webhook.service_name),
            ("cluster.name", &self.cluster.name),
        ] {
            if value.is_empty() {
                return Err(Invalid::Required { field });
            }
        }
        if !is_dns_1123_hostname(&self.webhook.service_name) {
            return Err(Invalid::Hostname {
                field: "webhook.serviceName",
                value: self.webhook.service_name.clone(),
            });
        }

        let http = &self.ingress.http;
        if http.enabled {
            check_port("ingress.http.bind", http.bind, 1)?;
            check_port("ingress.http.listen", http.listen, 1)?;
        }
        check_port("ingress.http.nodePort", http.node_port, 0)?;

        let tls = &self.ingress.tls;
        if tls.enabled {
            check_port("ingress.tls.bind", tls.bind, 1)?;
            check_port("ingress.tls.listen", tls.listen, 1)?;
        }
        check_port("ingress.tls.nodePort", tls.node_port, 0)?;
        if tls.ssl_passthrough.enabled {
            check_port(
                "ingress.tls.sslPassthrough.upstreamPort",
                tls.ssl_passthrough.upstream_port,
                1,
            )?;
        }

        self.certificate_manager()?;
        Ok(())
    }

    pub fn repo_root_url(&self) -> &str {
        &self.repo.root_url
    }

    pub fn ingress_enabled(&self) -> bool {
        self.ingress.enabled && !self.gateway_api.enabled
    }

    pub fn namespaced_ingress_enabled(&self) -> bool {
        self.ingress_enabled() && self.ingress.namespaced
    }

    /// The upstream port of passed-through TLS connections, when enabled.
    pub fn ssl_passthrough_port(&self) -> Option<u16> {
        let tls = &self.ingress.tls;
        if !(tls.enabled && tls.ssl_passthrough.enabled) {
            return None;
        }
        u16::try_from(tls.ssl_passthrough.upstream_port).ok()
    }

    /// True unless this process runs in a cluster managed by another control
    /// plane.
    pub fn is_control_plane(&self) -> bool {
        self.cluster.control_plane_uid.is_empty()
            || self.cluster.uid == self.cluster.control_plane_uid
    }

    pub fn default_services_path(&self) -> &'static str {
        DEFAULT_SERVICES_PATH
    }

    pub fn default_ingress_path(&self) -> &'static str {
        DEFAULT_INGRESS_PATH
    }

    pub fn cluster_key(&self) -> ClusterKey {
        let c = &self.cluster;
        ClusterKey::new(&c.region, &c.zone, &c.group, &c.name)
    }

    /// The UID of the control plane that manages the home cluster.
    pub fn control_plane_uid(&self) -> &str {
        if self.cluster.control_plane_uid.is_empty() {
            &self.cluster.uid
        } else {
            &self.cluster.control_plane_uid
        }
    }

    pub fn certificate_manager(&self) -> Result<CertificateManager, Invalid> {
        self.certificate.manager.parse()
    }

    pub fn pipy_image(&self) -> String {
        format!("{}/{}", self.images.repository, self.images.pipy_image)
    }
}

impl FromStr for MeshConfig {
    type Err = Invalid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config = serde_json::from_str::<Self>(s).map_err(|e| Invalid::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

// === impl CertificateManager ===

impl FromStr for CertificateManager {
    type Err = Invalid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "" | "archon" => Ok(Self::Archon),
            "cert-manager" => Ok(Self::CertManager),
            s => Err(Invalid::CertificateManager(s.to_string())),
        }
    }
}

impl fmt::Display for CertificateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => "manual".fmt(f),
            Self::Archon => "archon".fmt(f),
            Self::CertManager => "cert-manager".fmt(f),
        }
    }
}

fn check_port(field: &'static str, value: u32, min: u32) -> Result<(), Invalid> {
    if value < min || value > u32::from(u16::MAX) {
        return Err(Invalid::Port { field, value, min });
    }
    Ok(())
}

/// Validates an RFC 1123 hostname: dot-separated labels of lowercase
/// alphanumerics and `-`, neither starting nor ending with `-`.
pub fn is_dns_1123_hostname(s: &str) -> bool {
    s.len() <= DNS_1123_HOSTNAME_MAX_LEN && DNS_1123_HOSTNAME.is_match(s)
}
