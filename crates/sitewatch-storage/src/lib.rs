//! Page fetching, raw page archive and snapshot persistence for SiteWatch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sitewatch_core::PageFetch;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{AcquireError, Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub mod snapshots;

pub use snapshots::{MemorySnapshotStore, PgSnapshotStore, SnapshotStore};

pub const CRATE_NAME: &str = "sitewatch-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw page bodies.
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

    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        domain: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(domain_slug(domain))
            .join(stamp)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        domain: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(fetched_at, domain, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let stored = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

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

/// Filesystem-safe form of a domain (or URL) for archive paths.
pub fn domain_slug(domain: &str) -> String {
    let stripped = domain
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let slug = stripped
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect::<String>();
    let slug = slug.trim_matches('_').to_string();
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug
    }
}

/// URL fetched for a domain: bare hosts get an https scheme.
pub fn page_url(domain: &str) -> String {
    let domain = domain.trim();
    if domain.starts_with("http://") || domain.starts_with("https://") {
        domain.to_string()
    } else {
        format!("https://{}", domain.trim_end_matches('/'))
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
            max_retries: 2,
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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_domain_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_domain_concurrency: 1,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Politeness cap on outbound page requests, shared by every domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Requests allowed back to back before spacing kicks in.
    pub burst: u32,
    /// One more request is allowed each time this much time passes.
    pub refill_every: Duration,
}

impl RateLimit {
    /// Evenly spaced requests, `requests` per minute. Zero means unlimited.
    pub fn per_minute(requests: u32) -> Option<Self> {
        if requests == 0 {
            return None;
        }
        Some(Self {
            burst: 1,
            refill_every: Duration::from_secs(60) / requests,
        })
    }
}

#[derive(Debug)]
struct ThrottleState {
    available: u32,
    refilled_at: tokio::time::Instant,
}

/// Waits callers out until the [`RateLimit`] admits another request.
#[derive(Debug)]
pub struct RequestThrottle {
    limit: RateLimit,
    state: Mutex<ThrottleState>,
}

impl RequestThrottle {
    pub fn new(limit: RateLimit) -> Self {
        let limit = RateLimit {
            burst: limit.burst.max(1),
            refill_every: limit.refill_every.max(Duration::from_nanos(1)),
        };
        Self {
            limit,
            state: Mutex::new(ThrottleState {
                available: limit.burst,
                refilled_at: tokio::time::Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = tokio::time::Instant::now();
                let earned = now.duration_since(state.refilled_at).as_nanos()
                    / self.limit.refill_every.as_nanos();
                if earned > 0 {
                    let earned = u32::try_from(earned).unwrap_or(u32::MAX);
                    let topped_up = state.available.saturating_add(earned);
                    if topped_up >= self.limit.burst {
                        state.available = self.limit.burst;
                        state.refilled_at = now;
                    } else {
                        // earned < burst here, so the multiplication stays small
                        state.available = topped_up;
                        state.refilled_at += self.limit.refill_every * earned;
                    }
                }
                if state.available > 0 {
                    state.available -= 1;
                    return;
                }
                (state.refilled_at + self.limit.refill_every).saturating_duration_since(now)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Source of page content for a domain. Implementations never fail: a
/// failed fetch is reported inside the returned [`PageFetch`].
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, domain: &str) -> PageFetch;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_domain_limit: usize,
    per_domain: Mutex<HashMap<String, Arc<Semaphore>>>,
    throttle: Option<RequestThrottle>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("concurrency limiter closed")]
    LimiterClosed(#[from] AcquireError),
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let throttle = config.rate_limit.map(RequestThrottle::new);

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_domain_limit: config.per_domain_concurrency.max(1),
            per_domain: Mutex::new(HashMap::new()),
            throttle,
            backoff: config.backoff,
        })
    }

    async fn per_domain_semaphore(&self, domain: &str) -> Arc<Semaphore> {
        let mut map = self.per_domain.lock().await;
        map.entry(domain.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_domain_limit)))
            .clone()
    }

    /// GET `url` with retries; `elapsed` covers the successful attempt only.
    pub async fn fetch_bytes(&self, domain: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await?;
        let per_domain = self.per_domain_semaphore(domain).await;
        let _domain = per_domain.acquire().await?;

        if let Some(throttle) = &self.throttle {
            throttle.acquire().await;
        }

        let span = info_span!("http_fetch", domain, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let started = Instant::now();
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                            elapsed: started.elapsed(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_page(&self, domain: &str) -> PageFetch {
        let url = page_url(domain);
        let fetched_at = Utc::now();
        match self.fetch_bytes(domain, &url).await {
            Ok(resp) => PageFetch::succeeded(
                domain,
                resp.final_url,
                resp.status.as_u16(),
                String::from_utf8_lossy(&resp.body).into_owned(),
                resp.elapsed,
                fetched_at,
            ),
            Err(err) => {
                warn!(domain, %url, error = %err, "page fetch failed; snapshot will be degraded");
                let mut page = PageFetch::failed(domain, url, err.to_string(), fetched_at);
                if let FetchError::HttpStatus { status, .. } = &err {
                    page.status = Some(*status);
                }
                page
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers one connection per scripted `(status, body)` pair, in order.
    async fn scripted_site(responses: Vec<(u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&chunk[..n]);
                }
                let reply = format!(
                    "HTTP/1.1 {status} Scripted\r\ncontent-type: text/html\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/")
    }

    fn quick_retry_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            ..HttpClientConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn not_found_page_is_a_failed_fetch_with_status() {
        let site = scripted_site(vec![(404, "gone")]).await;
        let page = quick_retry_fetcher().fetch_page(&site).await;

        assert!(!page.is_success());
        assert_eq!(page.status, Some(404));
        assert!(page.body.is_none());
        assert!(page.error.as_deref().unwrap_or_default().contains("404"));
    }

    #[tokio::test]
    async fn unavailable_page_is_retried_until_it_loads() {
        let site = scripted_site(vec![(503, "busy"), (200, "<title>Acme</title>")]).await;
        let page = quick_retry_fetcher().fetch_page(&site).await;

        assert!(page.is_success());
        assert_eq!(page.status, Some(200));
        assert_eq!(page.body.as_deref(), Some("<title>Acme</title>"));
        assert!(page.elapsed.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_spaces_requests_once_the_burst_is_spent() {
        let throttle = RequestThrottle::new(RateLimit {
            burst: 2,
            refill_every: Duration::from_secs(1),
        });
        let start = tokio::time::Instant::now();

        throttle.acquire().await;
        throttle.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        throttle.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        throttle.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_throttle_refills_only_up_to_its_burst() {
        let throttle = RequestThrottle::new(RateLimit {
            burst: 2,
            refill_every: Duration::from_secs(1),
        });
        throttle.acquire().await;
        throttle.acquire().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        let start = tokio::time::Instant::now();
        throttle.acquire().await;
        throttle.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        throttle.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn per_minute_limit_spreads_requests_evenly() {
        assert_eq!(RateLimit::per_minute(0), None);
        assert_eq!(
            RateLimit::per_minute(30),
            Some(RateLimit {
                burst: 1,
                refill_every: Duration::from_secs(2),
            })
        );
    }

    #[tokio::test]
    async fn archive_dedups_within_one_domain_and_capture_stamp() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let monday = DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let tuesday = DateTime::parse_from_rfc3339("2026-03-03T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let body = b"<html><title>Pricing</title></html>";

        let acme = store.store_bytes(monday, "acme.io", "html", body).await.unwrap();
        let acme_again = store.store_bytes(tuesday, "acme.io", "html", body).await.unwrap();
        let acme_repeat = store.store_bytes(monday, "acme.io", "html", body).await.unwrap();
        let rival = store.store_bytes(monday, "rival.io", "html", body).await.unwrap();

        assert!(!acme.deduplicated);
        assert!(!rival.deduplicated);
        assert_eq!(acme.content_hash, rival.content_hash);
        assert_ne!(acme.relative_path, rival.relative_path);
        assert!(rival.relative_path.starts_with("rival.io"));
        assert!(acme.absolute_path.exists());
        assert_eq!(acme.byte_size, body.len());
        assert!(acme_repeat.deduplicated);
        assert_eq!(acme_repeat.relative_path, acme.relative_path);
        assert!(!acme_again.deduplicated);
        assert_ne!(acme_again.relative_path, acme.relative_path);
    }

    #[test]
    fn throttling_and_outages_are_retried_but_missing_pages_are_not() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn bare_domains_get_https_scheme() {
        assert_eq!(page_url("acme.io"), "https://acme.io");
        assert_eq!(page_url("acme.io/"), "https://acme.io");
        assert_eq!(page_url("http://localhost:8080/"), "http://localhost:8080/");
        assert_eq!(domain_slug("https://Acme.io/pricing"), "acme.io_pricing");
    }
}
