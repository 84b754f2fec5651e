use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

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
            max_delay: Duration::from_secs(2),
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
    /// Per-request timeout; the run deadline bounds requests on top of this.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    /// The source answered, and the answer is that the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 404, .. })
    }
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

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GET with bounded concurrency and retries on transient failures.
    pub async fn get(&self, source: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", source, url);
        self.get_with_retries(url).instrument(span).await
    }

    async fn get_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
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
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after status");
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
                        debug!(error = %err, attempt, "retrying after request error");
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
