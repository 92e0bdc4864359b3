//! A client of the admin API of a castle node.

use anyhow::{Context, Result};
use reqwest::{StatusCode, Url};

use castle_core::AppError;

/// The body of a file system creation request.
#[derive(Debug, serde::Serialize)]
pub struct FilesystemRequest<'a> {
    pub name: &'a str,
    pub pool: &'a str,
}

/// A client of the admin API.
pub struct AdminClient {
    base: Url,
    http: reqwest::Client,
}

impl AdminClient {
    /// Create a new client of the admin API at the given URL.
    pub fn new(url: &str) -> Result<Self> {
        let base = Url::parse(url).map_err(|err| AppError::ConfigInvalid(format!("invalid admin URL {:?}: {}", url, err)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(AppError::ConfigInvalid(format!("unsupported scheme in admin URL {:?}", url)).into());
        }
        Ok(Self { base, http: reqwest::Client::new() })
    }

    /// The full URL of the given API path.
    pub fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("error building admin URL for {}", path))
    }

    pub async fn create_filesystem(&self, name: &str, pool: &str) -> Result<()> {
        let req = self.http.post(self.url("/filesystems")?).json(&FilesystemRequest { name, pool });
        self.send(req).await
    }

    pub async fn delete_filesystem(&self, name: &str) -> Result<()> {
        let mut url = self.url("/filesystems")?;
        url.path_segments_mut()
            .map_err(|_| AppError::ConfigInvalid(format!("admin URL {} cannot carry a path", self.base)))?
            .push(name);
        self.send(self.http.delete(url)).await
    }

    pub async fn create_object_store(&self) -> Result<()> {
        self.send(self.http.post(self.url("/objectstore")?)).await
    }

    pub async fn delete_object_store(&self) -> Result<()> {
        self.send(self.http.delete(self.url("/objectstore")?)).await
    }

    pub async fn refresh(&self) -> Result<()> {
        self.send(self.http.post(self.url("/refresh")?)).await
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<()> {
        let res = req.send().await.context("error reaching castle admin API")?;
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        tracing::debug!(%status, body = %body, "admin API response");
        check_status(status, body)
    }
}

/// Map an admin API response onto the error kinds the exit code is derived from.
pub fn check_status(status: StatusCode, body: String) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    let msg = if body.is_empty() { status.to_string() } else { body };
    Err(match status {
        StatusCode::NOT_FOUND => AppError::NotFound(msg),
        status if status.is_client_error() => AppError::ConfigInvalid(msg),
        _ => AppError::TransientIo(format!("admin API returned {}: {}", status, msg)),
    }
    .into())
}
