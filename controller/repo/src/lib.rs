//! A client for the proxy's script repository.
//!
//! The repository stores configuration as versioned *codebases*. Files
//! written into a codebase are staged until the codebase is committed, at
//! which point every staged write becomes visible to proxies at once.
//! Codebases may be derived from a base codebase, inheriting its files.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
mod codebase;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;


pub use self::{
    client::Client,
    codebase::{Batch, BatchItem, Codebase},
};

pub const REPO_API_PATH: &str = "/api/v1/repo";
pub const FILE_API_PATH: &str = "/api/v1/repo-files";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("repo responded with HTTP {status} for {path}: {body}")]
    Http {
        status: u16,
        path: String,
        body: String,
    },

    #[error("failed to reach the repo: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid repo response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} not found in repo")]
    NotFound(String),

    #[error("codebase {0} already exists")]
    AlreadyExists(String),

    #[error("base {base} of codebase {path} does not exist")]
    BaseMissing { path: String, base: String },

    #[error("repo did not become ready within {0:?}")]
    Unavailable(std::time::Duration),
}
