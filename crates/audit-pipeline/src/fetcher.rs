//! Governed retrieval of the target document
//!
//! One HTTP client per request with connection pooling switched off, a
//! bounded redirect chain, a total timeout and a streaming size ceiling.
//! Nothing here retries.

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::{redirect, Client, Url};
use shared_types::ErrorKind;
use tracing::{debug, instrument, warn};

use crate::config::FetchConfig;
use crate::error::PipelineError;

/// Limits for a single fetch
#[derive(Debug, Clone)]
pub struct FetchLimits {
    pub timeout: Duration,
    pub max_content_length: u64,
    pub max_redirects: usize,
    pub user_agent: String,
}

impl FetchLimits {
    /// Limits from config, with the timeout shortened to what is left of the request budget
    pub fn from_config(config: &FetchConfig, remaining: Duration) -> Self {
        Self {
            timeout: config.timeout().min(remaining),
            max_content_length: config.max_content_length,
            max_redirects: config.max_redirects,
            user_agent: config.user_agent.clone(),
        }
    }
}

/// Raw response, consumed once by the sanitizer
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    /// `Content-Length` as declared by the server
    pub declared_length: Option<u64>,
    pub status: u16,
    /// URL after following redirects
    pub final_url: String,
}

#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, url: &Url, limits: &FetchLimits)
        -> Result<FetchedDocument, PipelineError>;
}

/// reqwest-backed fetcher
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFetcher;

impl HttpFetcher {
    fn client(limits: &FetchLimits) -> Result<Client, PipelineError> {
        Client::builder()
            .timeout(limits.timeout)
            .connect_timeout(limits.timeout)
            .redirect(redirect::Policy::limited(limits.max_redirects))
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| {
                PipelineError::new(
                    ErrorKind::ServerError,
                    format!("Failed to build HTTP client: {}", e),
                )
            })
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    #[instrument(skip(self, limits), fields(url = %url))]
    async fn fetch(
        &self,
        url: &Url,
        limits: &FetchLimits,
    ) -> Result<FetchedDocument, PipelineError> {
        let client = Self::client(limits)?;

        let mut response = client
            .get(url.clone())
            .header(USER_AGENT, limits.user_agent.as_str())
            .send()
            .await
            .map_err(|e| network_error(&e))?;

        let status = response.status();
        let final_url = response.url().to_string();
        if !(status.is_success() || status.is_redirection()) {
            return Err(PipelineError::new(
                ErrorKind::HttpError,
                format!("Server responded with HTTP {}", status.as_u16()),
            )
            .with_details(status.as_u16().to_string()));
        }

        let declared_length = response.content_length();
        if let Some(length) = declared_length {
            if length > limits.max_content_length {
                return Err(oversized(length, limits.max_content_length));
            }
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = Vec::with_capacity(
            declared_length
                .unwrap_or(0)
                .min(limits.max_content_length) as usize,
        );
        while let Some(chunk) = response.chunk().await.map_err(|e| network_error(&e))? {
            if (body.len() + chunk.len()) as u64 > limits.max_content_length {
                warn!(
                    "Aborting download after {} bytes, ceiling is {}",
                    body.len() + chunk.len(),
                    limits.max_content_length
                );
                return Err(oversized(
                    (body.len() + chunk.len()) as u64,
                    limits.max_content_length,
                ));
            }
            body.extend_from_slice(&chunk);
        }

        debug!(
            "Fetched {} bytes (status {}, final url {})",
            body.len(),
            status.as_u16(),
            final_url
        );

        Ok(FetchedDocument {
            body,
            content_type,
            declared_length,
            status: status.as_u16(),
            final_url,
        })
    }
}

fn oversized(seen: u64, ceiling: u64) -> PipelineError {
    PipelineError::new(
        ErrorKind::OversizedResponse,
        format!(
            "Response of at least {} bytes exceeds the {} byte limit",
            seen, ceiling
        ),
    )
    .with_details(ceiling.to_string())
}

/// Map a transport failure to `NETWORK_ERROR` with a causal code
pub fn network_error(err: &reqwest::Error) -> PipelineError {
    let code = classify(err);
    PipelineError::new(ErrorKind::NetworkError, format!("Failed to fetch page: {}", err))
        .with_details(code)
}

fn classify(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        return "TIMEOUT";
    }
    if err.is_redirect() {
        return "TOO_MANY_REDIRECTS";
    }

    let chain = source_chain(err).to_lowercase();
    if chain.contains("dns error") || chain.contains("failed to lookup address") {
        "DNS"
    } else if chain.contains("connection refused") {
        "CONNECTION_REFUSED"
    } else if chain.contains("connection reset") {
        "CONNECTION_RESET"
    } else if err.is_connect() {
        "CONNECT"
    } else if err.is_body() || err.is_decode() {
        "BODY"
    } else {
        "REQUEST"
    }
}

fn source_chain(err: &reqwest::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}
