#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use erie_canal_controller_core as core;
pub use erie_canal_controller_k8s_api as k8s;
pub use erie_canal_controller_k8s_index as index;
pub use erie_canal_controller_k8s_status as status;
pub use erie_canal_controller_repo as repo;

mod admission;
mod args;
mod broker;
mod clusters;
mod connector;
mod events;
mod health;
mod index_pair;
mod lease;
mod limit;
mod mesh;
mod publish;
mod reconciler;
mod runner;
mod validation;

#[cfg(test)]
mod tests;

pub use self::args::Args;
