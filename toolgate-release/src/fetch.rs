use std::path::Path;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{ReleaseError, Result};

/// Transport used by the resolver and cache to reach the release host.
///
/// Kept behind a trait so tests can count downloads without a network.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// GET `url` and return the full body. Used for small documents only
    /// (release index, checksum manifest).
    async fn get(&self, url: &str) -> Result<Vec<u8>>;

    /// Stream `url` into a newly created file at `dest`. Returns bytes written.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// [`Fetch`] implementation over `reqwest`.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("toolgate-release/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ReleaseError::Network(format!("GET {}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(ReleaseError::HttpStatus {
                url: url.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.send(url).await?;
        let body = resp
            .bytes()
            .await
            .map_err(|e| ReleaseError::Network(format!("reading {}: {}", url, e)))?;
        Ok(body.to_vec())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let resp = self.send(url).await?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| ReleaseError::io(format!("create {}", dest.display()), e))?;

        let mut written = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| ReleaseError::Network(format!("reading {}: {}", url, e)))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ReleaseError::io(format!("write {}", dest.display()), e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| ReleaseError::io(format!("flush {}", dest.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| ReleaseError::io(format!("sync {}", dest.display()), e))?;

        debug!(url, bytes = written, path = %dest.display(), "download complete");
        Ok(written)
    }
}
