//! Bulletin retrieval, immutable raw-artifact archive and the alert table.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rasff_core::Period;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod alert_store;

pub use alert_store::{AlertStore, StoreError, ALERTS_TABLE, DEFAULT_DATABASE_URL};

pub const CRATE_NAME: &str = "rasff-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of fetched bulletin files.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `<year>/W<ww>/<hash>.<ext>`
    pub fn artifact_relative_path(&self, period: Period, content_hash: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(period.year().to_string())
            .join(format!("W{:02}", period.week()))
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        period: Period,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(period, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let stored = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .expect("artifact path always has parent")
            .to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

pub const DEFAULT_BASE_URL: &str = "https://www.sirene-diffusion.fr/regia/000-rasff";

/// `{base_url}/{yy}/{prefix}-{year}-{ww}.{extension}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulletinUrlTemplate {
    pub base_url: String,
    pub file_prefix: String,
    pub extension: String,
}

impl Default for BulletinUrlTemplate {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            file_prefix: "rasff".to_string(),
            extension: "xls".to_string(),
        }
    }
}

impl BulletinUrlTemplate {
    pub fn url_for(&self, period: Period) -> String {
        format!(
            "{}/{:02}/{}-{}-{:02}.{}",
            self.base_url.trim_end_matches('/'),
            period.short_year(),
            self.file_prefix,
            period.year(),
            period.week(),
            self.extension
        )
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Found(Vec<u8>),
    /// No file for this period (yet). Carries the HTTP status that said so.
    NotFound { status: u16 },
    /// Network failure, timeout or persistent server error after retries.
    TransientError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub period: Period,
    pub url: String,
    pub outcome: FetchOutcome,
}

/// Where weekly bulletins come from. The payload is never parsed here.
#[async_trait]
pub trait BulletinSource: Send + Sync {
    fn url_for(&self, period: Period) -> String;

    async fn fetch(&self, period: Period) -> FetchResult;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    urls: BulletinUrlTemplate,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig, urls: BulletinUrlTemplate) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
            urls,
        })
    }

    pub fn urls(&self) -> &BulletinUrlTemplate {
        &self.urls
    }

    async fn fetch_url(&self, url: &str) -> FetchOutcome {
        for attempt in 0..=self.backoff.max_retries {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => return FetchOutcome::Found(body.to_vec()),
                            Err(err)
                                if can_retry
                                    && classify_reqwest_error(&err) == RetryDisposition::Retryable =>
                            {
                                debug!(attempt, error = %err, "body read failed; retrying");
                            }
                            Err(err) => {
                                return FetchOutcome::TransientError(format!("reading body: {err}"))
                            }
                        }
                    } else if status == StatusCode::NOT_FOUND
                        || classify_status(status) == RetryDisposition::NonRetryable
                    {
                        return FetchOutcome::NotFound {
                            status: status.as_u16(),
                        };
                    } else if can_retry {
                        debug!(attempt, %status, "retryable status; backing off");
                    } else {
                        return FetchOutcome::TransientError(format!(
                            "http status {status} after {} attempts",
                            attempt + 1
                        ));
                    }
                }
                Err(err) => {
                    if can_retry && classify_reqwest_error(&err) == RetryDisposition::Retryable {
                        debug!(attempt, error = %err, "request failed; retrying");
                    } else {
                        return FetchOutcome::TransientError(err.to_string());
                    }
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
        }

        FetchOutcome::TransientError("retries exhausted".to_string())
    }
}

#[async_trait]
impl BulletinSource for HttpFetcher {
    fn url_for(&self, period: Period) -> String {
        self.urls.url_for(period)
    }

    async fn fetch(&self, period: Period) -> FetchResult {
        let url = self.urls.url_for(period);
        let span = info_span!("http_fetch", %period, url = %url);
        let outcome = self.fetch_url(&url).instrument(span).await;
        FetchResult {
            period,
            url,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn period(year: i32, week: u32) -> Period {
        Period::new(year, week).unwrap()
    }

    /// Answers every connection with the same canned HTTP response.
    async fn canned_server(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    fn fetcher_for(base_url: String, max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(
            HttpClientConfig {
                timeout: Duration::from_secs(5),
                user_agent: Some("rasff-test".into()),
                backoff: BackoffPolicy {
                    max_retries,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                },
            },
            BulletinUrlTemplate {
                base_url,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn archive_path_is_keyed_by_week_and_payload_hash() {
        let store = ArtifactStore::new("/var/lib/rasff/artifacts");
        let empty = ArtifactStore::sha256_hex(b"");
        assert_eq!(
            empty,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            store.artifact_relative_path(period(2020, 53), &empty, ".xls"),
            PathBuf::from(format!("2020/W53/{empty}.xls"))
        );
        assert_eq!(
            store.artifact_relative_path(period(2024, 3), "abc", ""),
            PathBuf::from("2024/W03/abc.bin")
        );
        assert_ne!(
            ArtifactStore::sha256_hex(b"Date;Reference\n05/03/2024;2024.1\n"),
            ArtifactStore::sha256_hex(b"Date;Reference\n05/03/2024;2024.2\n")
        );
    }

    #[tokio::test]
    async fn atomic_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let first = store
            .store_bytes(period(2024, 11), "xls", b"bulletin bytes")
            .await
            .expect("first store");
        let second = store
            .store_bytes(period(2024, 11), ".xls", b"bulletin bytes")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("2024/W11"));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn default_bulletin_backoff_doubles_up_to_five_seconds() {
        let policy = BackoffPolicy::default();
        let delays = (0..7).map(|attempt| policy.delay_for_attempt(attempt).as_millis()).collect::<Vec<_>>();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 5000, 5000]);
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn url_is_determined_by_the_period() {
        let urls = BulletinUrlTemplate::default();
        assert_eq!(
            urls.url_for(period(2025, 3)),
            "https://www.sirene-diffusion.fr/regia/000-rasff/25/rasff-2025-03.xls"
        );
        assert_eq!(
            urls.url_for(period(2009, 45)),
            "https://www.sirene-diffusion.fr/regia/000-rasff/09/rasff-2009-45.xls"
        );
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn ok_response_is_found_with_raw_bytes() {
        let base = canned_server(
            "HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello",
        )
        .await;
        let result = fetcher_for(base, 0).fetch(period(2024, 11)).await;
        assert_eq!(result.outcome, FetchOutcome::Found(b"hello".to_vec()));
        assert!(result.url.ends_with("/24/rasff-2024-11.xls"));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let base = canned_server(
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let result = fetcher_for(base, 3).fetch(period(2024, 12)).await;
        assert_eq!(result.outcome, FetchOutcome::NotFound { status: 404 });
    }

    #[tokio::test]
    async fn persistent_server_error_is_transient() {
        let base = canned_server(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let result = fetcher_for(base, 1).fetch(period(2024, 12)).await;
        assert!(matches!(result.outcome, FetchOutcome::TransientError(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = fetcher_for(format!("http://{addr}"), 0)
            .fetch(period(2024, 12))
            .await;
        assert!(matches!(result.outcome, FetchOutcome::TransientError(_)));
    }
}
