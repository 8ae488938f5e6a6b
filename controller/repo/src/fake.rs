//! An in-memory repo server.
//!
//! Staged file writes only become readable once their codebase is committed,
//! mirroring what proxies observe.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

#[derive(Clone, Debug, Default)]
pub struct FakeRepo(Arc<Mutex<Inner>>);

#[derive(Debug, Default)]
struct Inner {
    codebases: BTreeMap<String, FakeCodebase>,
    committed: BTreeMap<String, String>,
    staged: BTreeMap<String, Staged>,
    commits: Vec<(String, u64)>,
    down: bool,
}

#[derive(Clone, Debug)]
struct FakeCodebase {
    version: u64,
    base: Option<String>,
}

#[derive(Clone, Debug)]
struct Staged {
    content_type: String,
    content: String,
}

#[derive(Debug, serde::Deserialize)]
struct CodebaseRequest {
    #[serde(default)]
    version: String,
    #[serde(default)]
    base: Option<String>,
}

// === impl FakeRepo ===

impl FakeRepo {
    /// Serves a new, empty repo on a loopback port, returning its root URL.
    pub async fn spawn() -> (Self, String) {
        let repo = Self::default();
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .expect("must bind a loopback port");
        let addr = listener.local_addr().expect("listener must have an address");
        let app = repo.router();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (repo, format!("http://{addr}"))
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/v1/repo/", get(get_root))
            .route(
                "/api/v1/repo/{*path}",
                get(get_codebase).post(post_codebase).patch(patch_codebase),
            )
            .route("/api/v1/repo-files/{*path}", get(get_file).post(post_file))
            .with_state(self.clone())
    }

    /// Creates a committed codebase holding `files`, keyed relative to `path`.
    pub fn seed(&self, path: &str, files: &[(&str, &str)]) {
        let mut inner = self.0.lock();
        inner.codebases.insert(
            path.to_string(),
            FakeCodebase {
                version: 1,
                base: None,
            },
        );
        for (file, content) in files {
            inner
                .committed
                .insert(format!("{path}{file}"), content.to_string());
        }
    }

    /// While down, every request fails with `503 Service Unavailable`.
    pub fn set_down(&self, down: bool) {
        self.0.lock().down = down;
    }

    pub fn version(&self, path: &str) -> Option<u64> {
        self.0.lock().codebases.get(path).map(|c| c.version)
    }

    pub fn base(&self, path: &str) -> Option<String> {
        self.0.lock().codebases.get(path).and_then(|c| c.base.clone())
    }

    /// The committed content of a file.
    pub fn file(&self, path: &str) -> Option<String> {
        self.0.lock().committed.get(path).cloned()
    }

    pub fn staged_content_type(&self, path: &str) -> Option<String> {
        self.0
            .lock()
            .staged
            .get(path)
            .map(|s| s.content_type.clone())
    }

    /// Every commit applied so far, as `(path, new version)`.
    pub fn commits(&self) -> Vec<(String, u64)> {
        self.0.lock().commits.clone()
    }
}

async fn get_root(State(repo): State<FakeRepo>) -> Response {
    if repo.0.lock().down {
        return unavailable();
    }
    Json(serde_json::json!({ "version": "0" })).into_response()
}

async fn get_codebase(State(repo): State<FakeRepo>, Path(path): Path<String>) -> Response {
    let path = normalize(&path);
    let inner = repo.0.lock();
    if inner.down {
        return unavailable();
    }
    let Some(codebase) = inner.codebases.get(&path) else {
        return (StatusCode::NOT_FOUND, "codebase not found").into_response();
    };
    let prefix = format!("{path}/");
    let files = inner
        .committed
        .keys()
        .filter_map(|f| f.strip_prefix(&prefix).map(|f| format!("/{f}")))
        .collect::<Vec<_>>();
    Json(serde_json::json!({
        "version": codebase.version.to_string(),
        "path": path,
        "base": codebase.base,
        "files": files,
    }))
    .into_response()
}

async fn post_codebase(
    State(repo): State<FakeRepo>,
    Path(path): Path<String>,
    body: String,
) -> Response {
    let path = normalize(&path);
    let mut inner = repo.0.lock();
    if inner.down {
        return unavailable();
    }
    let req = match serde_json::from_str::<CodebaseRequest>(&body) {
        Ok(req) => req,
        Err(error) => return (StatusCode::BAD_REQUEST, error.to_string()).into_response(),
    };
    if req.version != "1" {
        return (StatusCode::BAD_REQUEST, "new codebases start at version 1").into_response();
    }
    if inner.codebases.contains_key(&path) {
        return (StatusCode::CONFLICT, "codebase exists").into_response();
    }

    if let Some(base) = req.base.as_ref() {
        if !inner.codebases.contains_key(base) {
            return (StatusCode::NOT_FOUND, "base not found").into_response();
        }
        let prefix = format!("{base}/");
        let inherited = inner
            .committed
            .iter()
            .filter_map(|(f, c)| {
                f.strip_prefix(&prefix)
                    .map(|f| (format!("{path}/{f}"), c.clone()))
            })
            .collect::<Vec<_>>();
        inner.committed.extend(inherited);
    }

    inner.codebases.insert(
        path,
        FakeCodebase {
            version: 1,
            base: req.base,
        },
    );
    StatusCode::CREATED.into_response()
}

async fn patch_codebase(
    State(repo): State<FakeRepo>,
    Path(path): Path<String>,
    body: String,
) -> Response {
    let path = normalize(&path);
    let mut guard = repo.0.lock();
    let inner = &mut *guard;
    if inner.down {
        return unavailable();
    }
    let next = match serde_json::from_str::<CodebaseRequest>(&body)
        .ok()
        .and_then(|r| r.version.parse::<u64>().ok())
    {
        Some(next) => next,
        None => return (StatusCode::BAD_REQUEST, "invalid version").into_response(),
    };
    let Some(codebase) = inner.codebases.get_mut(&path) else {
        return (StatusCode::NOT_FOUND, "codebase not found").into_response();
    };
    if next != codebase.version + 1 {
        return (StatusCode::CONFLICT, "stale version").into_response();
    }
    codebase.version = next;

    let prefix = format!("{path}/");
    let staged = inner
        .staged
        .keys()
        .filter(|f| f.starts_with(&prefix))
        .cloned()
        .collect::<Vec<_>>();
    for file in staged {
        if let Some(Staged { content, .. }) = inner.staged.remove(&file) {
            inner.committed.insert(file, content);
        }
    }
    inner.commits.push((path, next));
    StatusCode::OK.into_response()
}

async fn get_file(State(repo): State<FakeRepo>, Path(path): Path<String>) -> Response {
    let path = normalize(&path);
    let inner = repo.0.lock();
    if inner.down {
        return unavailable();
    }
    match inner.committed.get(&path) {
        Some(content) => content.clone().into_response(),
        None => (StatusCode::NOT_FOUND, "file not found").into_response(),
    }
}

async fn post_file(
    State(repo): State<FakeRepo>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let path = normalize(&path);
    let mut inner = repo.0.lock();
    if inner.down {
        return unavailable();
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    inner.staged.insert(
        path,
        Staged {
            content_type,
            content: body,
        },
    );
    StatusCode::OK.into_response()
}

fn normalize(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

fn unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "repo is down").into_response()
}
