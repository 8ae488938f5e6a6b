#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cluster;
pub mod export;
mod hash;
mod resource_id;
pub mod routes;
pub mod tracker;

pub use self::{
    cluster::{ClusterInfo, ClusterKey},
    hash::stable_hash,
    resource_id::ResourceId,
};

pub const CONTROLLER_NAME: &str = "flomesh.io/erie-canal-manager";

/// The ingress class served by the proxy.
pub const INGRESS_CLASS: &str = "pipy";

/// Codebase that every member cluster's service registry is derived from.
pub const DEFAULT_SERVICE_BASE_PATH: &str = "/base/services";

/// Codebase that every member cluster's ingress configuration is derived from.
pub const DEFAULT_INGRESS_BASE_PATH: &str = "/base/ingress";
