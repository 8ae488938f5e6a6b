use crate::{Batch, Codebase, Error, FILE_API_PATH, REPO_API_PATH};
use reqwest::{header, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct Client {
    http: reqwest::Client,
    root: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Retry {
    Once,
    Never,
}

// === impl Client ===

impl Client {
    pub fn new(root_url: &str) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            root: root_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn root_url(&self) -> &str {
        &self.root
    }

    /// Fetches a codebase's metadata, returning `None` if it does not exist.
    pub async fn codebase(&self, path: &str) -> Result<Option<Codebase>, Error> {
        let rsp = self
            .send(self.http.get(self.repo_url(path)), Retry::Once)
            .await?;
        if rsp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let rsp = check(path, rsp).await?;
        let bytes = rsp.bytes().await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Returns the committed version of the codebase at `path`, if any.
    pub async fn exists(&self, path: &str) -> Result<Option<u64>, Error> {
        Ok(self.codebase(path).await?.map(|c| c.version))
    }

    /// Creates an empty codebase at version 1.
    pub async fn create(&self, path: &str) -> Result<Codebase, Error> {
        if self.codebase(path).await?.is_some() {
            return Err(Error::AlreadyExists(path.to_string()));
        }

        let req = self
            .http
            .post(self.repo_url(path))
            .json(&Codebase::request(1, None));
        check(path, self.send(req, Retry::Once).await?).await?;
        info!(%path, "Created codebase");

        self.codebase(path)
            .await?
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    /// Derives `path` from `base` and commits it.
    ///
    /// Deriving a codebase that already exists does nothing.
    pub async fn derive(&self, path: &str, base: &str) -> Result<(), Error> {
        if self.codebase(path).await?.is_some() {
            debug!(%path, "Codebase already exists");
            return Ok(());
        }
        if self.codebase(base).await?.is_none() {
            return Err(Error::BaseMissing {
                path: path.to_string(),
                base: base.to_string(),
            });
        }

        let req = self
            .http
            .post(self.repo_url(path))
            .json(&Codebase::request(1, Some(base)));
        check(path, self.send(req, Retry::Once).await?).await?;

        let codebase = self
            .codebase(path)
            .await?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        self.commit(path, codebase.version).await?;
        info!(%path, %base, "Derived codebase");
        Ok(())
    }

    /// Reads a file's committed content.
    pub async fn get(&self, path: &str) -> Result<String, Error> {
        let rsp = self
            .send(self.http.get(self.file_url(path)), Retry::Once)
            .await?;
        if rsp.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(path.to_string()));
        }
        Ok(check(path, rsp).await?.text().await?)
    }

    /// Stages a file write. The write is not visible until the enclosing
    /// codebase is committed.
    pub async fn upsert(&self, path: &str, content: String) -> Result<(), Error> {
        let content_type = if path.ends_with(".json") {
            "application/json"
        } else {
            "text/plain"
        };
        let req = self
            .http
            .post(self.file_url(path))
            .header(header::CONTENT_TYPE, content_type)
            .body(content);
        check(path, self.send(req, Retry::Once).await?).await?;
        debug!(%path, "Staged file");
        Ok(())
    }

    /// Commits all staged writes of the codebase at `path`, moving it from
    /// `version` to `version + 1`.
    ///
    /// Commits are never retried: a failed commit is left for the caller to
    /// re-attempt with its latest state.
    pub async fn commit(&self, path: &str, version: u64) -> Result<u64, Error> {
        let next = version + 1;
        let req = self
            .http
            .patch(self.repo_url(path))
            .json(&Codebase::request(next, None));
        check(path, self.send(req, Retry::Never).await?).await?;
        debug!(%path, version = next, "Committed codebase");
        Ok(next)
    }

    /// Applies each batch in order: the codebase is created if missing, every
    /// item is staged, and the codebase is committed once.
    ///
    /// The first failing batch aborts the remainder.
    pub async fn batch(&self, batches: &[Batch]) -> Result<(), Error> {
        for batch in batches {
            let version = match self.codebase(&batch.base_path).await? {
                Some(codebase) => codebase.version,
                None => self.create(&batch.base_path).await?.version,
            };

            for item in &batch.items {
                self.upsert(&item.full_path(&batch.base_path), item.content.clone())
                    .await?;
            }

            self.commit(&batch.base_path, version).await?;
        }
        Ok(())
    }

    /// Returns true if the repo serves its root codebase.
    pub async fn is_up(&self) -> bool {
        match self.codebase("/").await {
            Ok(_) => true,
            Err(error) => {
                debug!(%error, "Repo is not up");
                false
            }
        }
    }

    /// Polls the repo every `interval` until it is up, giving up after
    /// `timeout`.
    pub async fn wait_until_up(&self, interval: Duration, timeout: Duration) -> Result<(), Error> {
        let poll = async {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                if self.is_up().await {
                    return;
                }
                info!(root = %self.root, "Waiting for the repo to come up");
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| Error::Unavailable(timeout))
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}{}{}", self.root, REPO_API_PATH, path)
    }

    fn file_url(&self, path: &str) -> String {
        format!("{}{}{}", self.root, FILE_API_PATH, path)
    }

    async fn send(&self, req: RequestBuilder, retry: Retry) -> Result<Response, Error> {
        let again = match retry {
            Retry::Once => req.try_clone(),
            Retry::Never => None,
        };
        match req.send().await {
            Ok(rsp) => Ok(rsp),
            Err(error) if is_network_error(&error) => match again {
                Some(req) => {
                    warn!(%error, "Repo request failed; retrying");
                    Ok(req.send().await?)
                }
                None => Err(error.into()),
            },
            Err(error) => Err(error.into()),
        }
    }
}

fn is_network_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request()
}

async fn check(path: &str, rsp: Response) -> Result<Response, Error> {
    let status = rsp.status();
    if status.is_success() {
        return Ok(rsp);
    }
    let body = rsp.text().await.unwrap_or_default();
    Err(Error::Http {
        status: status.as_u16(),
        path: path.to_string(),
        body,
    })
}
