//! Polite HTTP fetch: jittered start, bounded retries on timeouts, no retries
//! on anything else.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, Instrument};

use crate::diagnostics::{DiagnosticSink, ScopedLog};

pub const DEFAULT_USER_AGENT: &str =
    "ecoh-harvester/0.1 (environmental monitoring data collector)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only timeouts are worth another attempt; the remote service answers
/// everything else deterministically.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the `attempt`-th failed attempt (1-based): base * 2^attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Uniform random delay applied once before the first attempt.
#[derive(Debug, Clone, Copy)]
pub struct JitterWindow {
    pub min: Duration,
    pub max: Duration,
}

impl Default for JitterWindow {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(500),
            max: Duration::from_millis(2000),
        }
    }
}

impl JitterWindow {
    pub fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn sample(&self) -> Duration {
        let lo = self.min.as_millis() as u64;
        let hi = self.max.as_millis() as u64;
        if hi <= lo {
            return Duration::from_millis(lo);
        }
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub jitter: JitterWindow,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            jitter: JitterWindow::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out after {attempts} attempts")]
    TimedOut { attempts: u32, url: String },
    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    #[error("endpoint not found (404): {url}")]
    NotFound { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("invalid JSON body from {url}: {source}")]
    InvalidJson {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("response from {url} has no \"nodes\" array")]
    MissingNodes { url: String },
}

impl FetchError {
    fn from_request(err: reqwest::Error) -> Self {
        match classify_reqwest_error(&err) {
            RetryDisposition::Retryable => FetchError::Timeout(err),
            RetryDisposition::NonRetryable => FetchError::Request(err),
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Timeout(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

static NULL_NODE: JsonValue = JsonValue::Null;

/// A 2xx response whose body carried a `"nodes"` array.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub final_url: String,
    pub nodes: Vec<JsonValue>,
}

impl RawResponse {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inner `node` objects of the `{ "node": { ... } }` wrappers. A wrapper
    /// without `node` yields `Null`, which answers `None` to every lookup.
    pub fn node_bodies(&self) -> impl Iterator<Item = &JsonValue> {
        self.nodes
            .iter()
            .map(|wrapper| wrapper.get("node").unwrap_or(&NULL_NODE))
    }
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub attempts: u32,
    pub result: Result<RawResponse, FetchError>,
}

impl FetchOutcome {
    /// Collapse to the pipeline's view: a response, or Empty.
    pub fn into_response(self) -> Option<RawResponse> {
        self.result.ok()
    }
}

pub struct PoliteFetcher {
    client: reqwest::Client,
    config: HttpClientConfig,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl PoliteFetcher {
    pub fn new(config: HttpClientConfig, diagnostics: Arc<dyn DiagnosticSink>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            config,
            diagnostics,
        })
    }

    /// Fetch `url`, logging under `name`. Never panics and never returns an
    /// error to the caller's control flow; failures are in the outcome.
    pub async fn fetch(&self, name: &str, url: &str) -> FetchOutcome {
        let span = info_span!("http_fetch", endpoint = name, url);
        self.fetch_inner(name, url).instrument(span).await
    }

    async fn fetch_inner(&self, name: &str, url: &str) -> FetchOutcome {
        let log = ScopedLog::new(self.diagnostics.clone(), name);

        let jitter = self.config.jitter.sample();
        if !jitter.is_zero() {
            log.debug(format!("waiting {} ms before first request", jitter.as_millis()));
            tokio::time::sleep(jitter).await;
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            log.info(format!("attempt {attempt}/{max_attempts}: GET {url}"));

            match self.attempt_once(url).await {
                Ok(response) => {
                    log.info(format!(
                        "request succeeded: status {}, {} nodes",
                        response.status,
                        response.nodes.len()
                    ));
                    return FetchOutcome {
                        attempts: attempt,
                        result: Ok(response),
                    };
                }
                Err(err) if err.disposition() == RetryDisposition::Retryable => {
                    log.warn(format!(
                        "timeout on attempt {attempt}/{max_attempts} for {url}: {err}"
                    ));
                    if attempt >= max_attempts {
                        log.error(format!("giving up on {url} after {attempt} attempts"));
                        return FetchOutcome {
                            attempts: attempt,
                            result: Err(FetchError::TimedOut {
                                attempts: attempt,
                                url: url.to_string(),
                            }),
                        };
                    }
                    tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                }
                Err(err) => {
                    log.error(format!("request to {url} failed: {err}"));
                    return FetchOutcome {
                        attempts: attempt,
                        result: Err(err),
                    };
                }
            }
        }
    }

    async fn attempt_once(&self, url: &str) -> Result<RawResponse, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(FetchError::from_request)?;

        let status = resp.status();
        let final_url = resp.url().to_string();

        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound { url: final_url });
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let bytes = resp.bytes().await.map_err(FetchError::from_request)?;
        let body: JsonValue = serde_json::from_slice(&bytes).map_err(|source| {
            FetchError::InvalidJson {
                url: final_url.clone(),
                source,
            }
        })?;

        let nodes = match body {
            JsonValue::Object(mut map) => match map.remove("nodes") {
                Some(JsonValue::Array(nodes)) => nodes,
                _ => return Err(FetchError::MissingNodes { url: final_url }),
            },
            _ => return Err(FetchError::MissingNodes { url: final_url }),
        };

        Ok(RawResponse {
            status: status.as_u16(),
            final_url,
            nodes,
        })
    }
}
