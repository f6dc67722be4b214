//! HTTP client for the remote cache tier.
//!
//! Read on local miss, write asynchronously on local update. Every
//! request carries the hex-encoded keyed-blake3 workspace token; the
//! server answers 403 on mismatch. Remote failures are never fatal to a
//! build: the caller logs and moves on.

use crate::{Fingerprint, TargetCacheEntry};
use mason_error::{BuildError, ErrorCode, Result};
use rand::Rng;
use std::time::Duration;

pub const TOKEN_HEADER: &str = "x-mason-token";

/// Transfer compression for blob payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

impl Compression {
    fn parse(value: &str) -> Self {
        match value {
            "zstd" => Compression::Zstd,
            _ => Compression::None,
        }
    }
}

/// Derive the workspace auth token from a shared secret and the
/// workspace tag. Deterministic on both ends of the wire.
pub fn workspace_token(secret: &str, workspace_tag: &str) -> String {
    let key = blake3::derive_key("mason remote cache token v1", secret.as_bytes());
    blake3::keyed_hash(&key, workspace_tag.as_bytes())
        .to_hex()
        .to_string()
}

#[derive(Debug, Clone)]
pub struct RemoteCacheConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub compression: Compression,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RemoteCacheConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            compression: Compression::None,
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// `REMOTE_CACHE_URL`, `REMOTE_CACHE_TOKEN`, `REMOTE_CACHE_COMPRESSION`.
    /// Returns `None` when no URL is configured.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("REMOTE_CACHE_URL").ok()?;
        let mut config = Self::new(base_url);
        if let Ok(token) = std::env::var("REMOTE_CACHE_TOKEN") {
            config.token = Some(token);
        }
        if let Ok(compression) = std::env::var("REMOTE_CACHE_COMPRESSION") {
            config.compression = Compression::parse(&compression);
        }
        Some(config)
    }
}

/// Async client over the §wire endpoints: `GET/PUT /cache/<fingerprint>`
/// and `GET/PUT /cas/<hash>`.
#[derive(Debug)]
pub struct RemoteCacheClient {
    http: reqwest::Client,
    config: RemoteCacheConfig,
}

impl RemoteCacheClient {
    pub fn new(config: RemoteCacheConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &RemoteCacheConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn with_token(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => req.header(TOKEN_HEADER, token),
            None => req,
        }
    }

    /// `GET /cache/<fingerprint>`: `Ok(None)` on 404.
    pub async fn get_metadata(&self, fingerprint: &Fingerprint) -> Result<Option<TargetCacheEntry>> {
        let url = self.url(&format!("cache/{fingerprint}"));
        let response = self
            .with_token(self.http.get(&url))
            .send()
            .await
            .map_err(network_error)?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let entry = response
                    .json::<TargetCacheEntry>()
                    .await
                    .map_err(|e| BuildError::new(ErrorCode::InvalidJson, e.to_string()))?;
                Ok(Some(entry))
            }
            status => Err(status_error(status, &url)),
        }
    }

    /// `PUT /cache/<fingerprint>`.
    pub async fn put_metadata(&self, entry: &TargetCacheEntry) -> Result<()> {
        let url = self.url(&format!("cache/{}", entry.fingerprint));
        let response = self
            .with_token(self.http.put(&url))
            .json(entry)
            .send()
            .await
            .map_err(network_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response.status(), &url))
        }
    }

    /// `GET /cas/<hash>`: `Ok(None)` on 404.
    pub async fn get_blob(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let url = self.url(&format!("cas/{hash}"));
        let response = self
            .with_token(self.http.get(&url))
            .send()
            .await
            .map_err(network_error)?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let bytes = response.bytes().await.map_err(network_error)?;
                Ok(Some(bytes.to_vec()))
            }
            status => Err(status_error(status, &url)),
        }
    }

    /// `PUT /cas/<hash>`. The server re-hashes the body and rejects a
    /// mismatch, so a corrupt upload cannot poison the remote store.
    pub async fn put_blob(&self, hash: &str, bytes: Vec<u8>) -> Result<()> {
        let url = self.url(&format!("cas/{hash}"));
        let response = self
            .with_token(self.http.put(&url))
            .body(bytes)
            .send()
            .await
            .map_err(network_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response.status(), &url))
        }
    }

    /// Push metadata plus blobs, retrying transient failures on the
    /// exponential ladder with ±15% jitter.
    pub async fn push_with_retry(
        &self,
        entry: &TargetCacheEntry,
        blobs: &[(String, Vec<u8>)],
    ) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.push_once(entry, blobs).await;
            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < self.config.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    tracing::debug!(
                        fingerprint = %entry.fingerprint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "remote push retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn push_once(
        &self,
        entry: &TargetCacheEntry,
        blobs: &[(String, Vec<u8>)],
    ) -> Result<()> {
        // Blobs upload concurrently; metadata goes last so a reader
        // that sees the entry can fetch every blob it references.
        futures::future::try_join_all(
            blobs
                .iter()
                .map(|(hash, bytes)| self.put_blob(hash, bytes.clone())),
        )
        .await?;
        self.put_metadata(entry).await
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff.as_millis() as f64
            * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.config.max_backoff.as_millis() as f64);
        let jitter = rand::thread_rng().gen_range(0.85..=1.15);
        Duration::from_millis((capped * jitter) as u64)
    }
}

fn network_error(err: reqwest::Error) -> BuildError {
    let code = if err.is_timeout() {
        ErrorCode::Timeout
    } else {
        ErrorCode::NetworkError
    };
    BuildError::new(code, err.to_string())
}

fn status_error(status: reqwest::StatusCode, url: &str) -> BuildError {
    let code = if status.is_server_error() {
        // Server-side trouble is worth retrying.
        ErrorCode::NetworkError
    } else {
        ErrorCode::ValidationFailed
    };
    BuildError::new(code, format!("remote cache returned {status} for {url}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_token_is_deterministic() {
        let a = workspace_token("secret", "ws-1");
        let b = workspace_token("secret", "ws-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_workspace_token_varies_by_secret_and_tag() {
        let base = workspace_token("secret", "ws-1");
        assert_ne!(base, workspace_token("other", "ws-1"));
        assert_ne!(base, workspace_token("secret", "ws-2"));
    }

    #[test]
    fn test_compression_parse() {
        assert_eq!(Compression::parse("zstd"), Compression::Zstd);
        assert_eq!(Compression::parse("none"), Compression::None);
        assert_eq!(Compression::parse("gzip"), Compression::None);
    }

    #[test]
    fn test_url_building() {
        let client = RemoteCacheClient::new(RemoteCacheConfig::new("http://cache:8080/"));
        assert_eq!(client.url("cache/abc"), "http://cache:8080/cache/abc");
    }

    #[test]
    fn test_backoff_ladder_is_capped() {
        let mut config = RemoteCacheConfig::new("http://cache");
        config.initial_backoff = Duration::from_millis(100);
        config.max_backoff = Duration::from_secs(1);
        let client = RemoteCacheClient::new(config);

        // 100ms * 2^9 = 51.2s uncapped; jitter stays within ±15% of cap.
        let delay = client.backoff_delay(10);
        assert!(delay <= Duration::from_millis(1150));
        assert!(delay >= Duration::from_millis(850));
    }
}
