//! Dataset fetch, workbook codec, and the shared table handle for INSERA.

use std::time::Duration;

use anyhow::Context;
use insera_core::Table;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, info_span, Instrument};

pub mod store;
pub mod workbook;

pub use store::{IngestSummary, TableStore};
pub use workbook::{decode, encode, ExportError, ParseError, EXPORT_FILE_NAME, SHEET_NAME, XLSX_MIME};

pub const CRATE_NAME: &str = "insera-storage";

/// Hex sha256 of a workbook payload, used to tell uploads apart in logs.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// 5xx and 429 are worth another attempt; any other status is final.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Only timeouts and failed connects are retried. Malformed URLs, redirect
/// loops and body errors fail on the first attempt.
pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// How many times a dataset download is retried and how long to wait between
/// attempts. The wait doubles per retry up to `max_wait`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: usize,
    pub first_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_wait: Duration::from_millis(250),
            max_wait: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn wait_before_retry(&self, retry: usize) -> Duration {
        let shift = u32::try_from(retry).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.first_wait.saturating_mul(factor).min(self.max_wait)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
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
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("fetching dataset: {0}")]
    Fetch(#[from] FetchError),
    #[error("parsing dataset: {0}")]
    Parse(#[from] ParseError),
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let HttpClientConfig {
            timeout,
            user_agent,
            retry,
        } = config;
        let builder = reqwest::Client::builder().gzip(true).brotli(true).timeout(timeout);
        let builder = match user_agent {
            Some(agent) => builder.user_agent(agent),
            None => builder,
        };
        let client = builder.build().context("building dataset http client")?;
        Ok(Self { client, retry })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0usize;
        loop {
            let outcome = self.fetch_once(url).await;
            let transient = match &outcome {
                Ok(_) => false,
                Err(FetchError::HttpStatus { status, .. }) => StatusCode::from_u16(*status)
                    .map(is_transient_status)
                    .unwrap_or(false),
                Err(FetchError::Request(err)) => is_transient_error(err),
            };
            if !transient || retry >= self.retry.retries {
                return outcome;
            }
            if let Err(err) = &outcome {
                tracing::warn!(retry, error = %err, "retrying dataset fetch");
            }
            tokio::time::sleep(self.retry.wait_before_retry(retry)).await;
            retry += 1;
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

/// Downloads the workbook at `url` and decodes it into a table.
pub async fn load_table(fetcher: &HttpFetcher, url: &str) -> Result<Table, LoadError> {
    let fetched = fetcher.fetch_bytes(url).await?;
    let table = workbook::decode(&fetched.body)?;
    info!(
        url = %fetched.final_url,
        bytes = fetched.body.len(),
        sha256 = %fingerprint(&fetched.body),
        records = table.len(),
        "dataset loaded"
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(
            fingerprint(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn retry_wait_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            retries: 5,
            first_wait: Duration::from_millis(100),
            max_wait: Duration::from_millis(350),
        };

        assert_eq!(policy.wait_before_retry(0), Duration::from_millis(100));
        assert_eq!(policy.wait_before_retry(1), Duration::from_millis(200));
        assert_eq!(policy.wait_before_retry(2), Duration::from_millis(350));
        assert_eq!(policy.wait_before_retry(40), Duration::from_millis(350));
    }

    #[test]
    fn only_server_errors_and_throttling_are_transient() {
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:9/dataset.xlsx")
            .send()
            .await
            .expect_err("nothing listens on the discard port");
        assert!(is_transient_error(&err));
    }

    #[tokio::test]
    async fn malformed_url_is_not_retried() {
        let err = reqwest::Client::new()
            .get("not a url")
            .send()
            .await
            .expect_err("url does not parse");
        assert!(!is_transient_error(&err));
    }

    #[tokio::test]
    async fn unreachable_source_is_a_fetch_error() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(500),
            user_agent: None,
            retry: RetryPolicy {
                retries: 0,
                first_wait: Duration::from_millis(1),
                max_wait: Duration::from_millis(1),
            },
        })
        .expect("client");
        let err = load_table(&fetcher, "http://127.0.0.1:9/dataset.xlsx")
            .await
            .expect_err("nothing listens on the discard port");
        assert!(matches!(err, LoadError::Fetch(_)));
    }
}
