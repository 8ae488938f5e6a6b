//! Writes the conditions the controller reports on cluster-set resources:
//! `Valid` and `Conflict` on ServiceExports, `Managed` on Clusters.
//!
//! Any replica may queue an [`Update`]; only the replica holding the lease
//! sends it to the API server.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod conditions;
mod controller;

pub use self::controller::{
    cluster_patch, export_patch, Controller, ControllerMetrics, Target, Update,
};
