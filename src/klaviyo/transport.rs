//!
//! HTTP transport for the Klaviyo REST API.
//!
//! The `HttpTransport` trait performs a single request. `send_with_retry` layers the retry
//! rules on top of it: 429 responses wait for `Retry-After` (or the exponential delay),
//! 5xx responses and connection failures back off exponentially, every other failure is
//! returned immediately.

use super::types::KlaviyoError;
use crate::settings::ApiKey;

use async_trait::async_trait;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, future::retry_notify};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// JSON:API media type used for request and response bodies.
const JSON_API: &str = "application/vnd.api+json";

/// A request to the Klaviyo API, independent of the HTTP library.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Short name of the API operation, used in errors and logs.
    pub operation: &'static str,
    pub method: Method,
    /// Absolute URL including the query string.
    pub url: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(operation: &'static str, url: impl Into<String>) -> Self {
        Self {
            operation,
            method: Method::GET,
            url: url.into(),
            body: None,
        }
    }

    pub fn patch(operation: &'static str, url: impl Into<String>, body: Value) -> Self {
        Self {
            operation,
            method: Method::PATCH,
            url: url.into(),
            body: Some(body),
        }
    }
}

/// Raw response as seen by the retry layer.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed `Retry-After` header (seconds form only).
    pub retry_after: Option<Duration>,
    pub body: String,
}

/// Failures below the HTTP status level.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Invalid header value for {0}")]
    InvalidHeader(&'static str),

    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Sends a single request and returns whatever status came back.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// `reqwest`-backed transport carrying the auth and revision headers.
pub struct ReqwestTransport {
    http_client: Client,
}

impl ReqwestTransport {
    /// Create a transport authenticating with `api_key` and pinned to API `revision`.
    pub fn new(api_key: &ApiKey, revision: &str, timeout: Duration) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();

        let mut authorization =
            HeaderValue::from_str(&format!("Klaviyo-API-Key {}", api_key.expose()))
                .map_err(|_| TransportError::InvalidHeader("Authorization"))?;
        authorization.set_sensitive(true);
        headers.insert(AUTHORIZATION, authorization);

        headers.insert(
            "revision",
            HeaderValue::from_str(revision).map_err(|_| TransportError::InvalidHeader("revision"))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static(JSON_API));

        let http_client = Client::builder()
            .timeout(timeout)
            .https_only(true)
            .default_headers(headers)
            .build()?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut builder = self
            .http_client
            .request(request.method.clone(), &request.url);
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, JSON_API)
                .body(body.to_string());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::HttpError(e)
            }
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::HttpError(e)
            }
        })?;

        debug!("{} {} -> {}", request.method, request.operation, status);
        Ok(ApiResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// Retry ceiling and exponential delay parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a request is sent at most `max_retries + 1` times.
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub randomization_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            randomization_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_multiplier(2.0)
            .with_randomization_factor(self.randomization_factor)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Send `request`, retrying rate limits and transient failures according to `policy`.
///
/// Returns the successful (2xx) response, or the classified error once the request is
/// rejected or the retries are used up.
pub async fn send_with_retry(
    transport: &dyn HttpTransport,
    policy: &RetryPolicy,
    request: &ApiRequest,
) -> Result<ApiResponse, KlaviyoError> {
    let max_retries = policy.max_retries;
    let mut attempt = 0u32;

    retry_notify(
        policy.backoff(),
        move || {
            attempt += 1;
            let current = attempt;
            async move {
                let outcome = transport.send(request).await;
                classify(outcome, request.operation, current, max_retries)
            }
        },
        |err: KlaviyoError, wait: Duration| match &err {
            KlaviyoError::RateLimited { operation, .. } => {
                warn!("Rate limited ({}), waiting {:?}", operation, wait);
            }
            other => {
                warn!("{}, retry in {:?}", other, wait);
            }
        },
    )
    .await
}

fn classify(
    outcome: Result<ApiResponse, TransportError>,
    operation: &'static str,
    attempt: u32,
    max_retries: u32,
) -> Result<ApiResponse, backoff::Error<KlaviyoError>> {
    let can_retry = attempt <= max_retries;
    let retryable = |err: KlaviyoError| {
        if can_retry {
            backoff::Error::transient(err)
        } else {
            backoff::Error::permanent(err)
        }
    };

    let response = match outcome {
        Ok(response) => response,
        Err(e) => {
            return Err(retryable(KlaviyoError::Transient {
                operation,
                attempts: attempt,
                detail: e.to_string(),
            }));
        }
    };

    match response.status {
        200..=299 => Ok(response),
        401 | 403 => Err(backoff::Error::permanent(KlaviyoError::Auth {
            operation,
            status: response.status,
            detail: error_detail(&response.body),
        })),
        404 => Err(backoff::Error::permanent(KlaviyoError::NotFound {
            operation,
            detail: error_detail(&response.body),
        })),
        429 => {
            let err = KlaviyoError::RateLimited {
                operation,
                attempts: attempt,
            };
            match response.retry_after {
                Some(wait) if can_retry => Err(backoff::Error::retry_after(err, wait)),
                _ => Err(retryable(err)),
            }
        }
        500..=599 => Err(retryable(KlaviyoError::Transient {
            operation,
            attempts: attempt,
            detail: format!("HTTP {}", response.status),
        })),
        status => Err(backoff::Error::permanent(KlaviyoError::Validation {
            operation,
            status,
            detail: error_detail(&response.body),
        })),
    }
}

/// First `errors[].detail` of a JSON:API error body, or the start of the raw body.
fn error_detail(body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body).ok().and_then(|parsed| {
        parsed
            .pointer("/errors/0/detail")
            .and_then(Value::as_str)
            .map(str::to_string)
    });

    detail.unwrap_or_else(|| body.chars().take(200).collect())
}
