//! HTTP dispatch of execution requests.
//!
//! A [`Dispatcher`] sends the request snapshot of one execution exactly once
//! and reports the outcome. It never retries on its own: every retry goes
//! through the retry coordinator so that it is counted and persisted.
//!
//! # Example
//!
//! ```rust,no_run
//! use courier::{Dispatcher, HttpDispatcher, HttpRequest};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), courier::DispatchError> {
//! let dispatcher = HttpDispatcher::new(Duration::from_secs(10))?;
//! let request = HttpRequest::new("POST", "https://hooks.example.com/nightly")
//!     .with_header("Content-Type", "application/json")
//!     .with_body(r#"{"report":"daily"}"#);
//!
//! let status = dispatcher.dispatch(&request).await?;
//! assert!((200..300).contains(&status));
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use thiserror::Error;

use crate::core::job::HttpRequest;

/// Default per-request timeout.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors produced by a single dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No response within the per-request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The target could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The target answered with a non-2xx status.
    #[error("HTTP {0}")]
    Status(u16),

    /// The stored request cannot be built. Never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A worker claimed the execution but never recorded an outcome.
    #[error("dispatch abandoned: no outcome after {0:?}")]
    Abandoned(Duration),

    /// Any other transport failure.
    #[error("dispatch failed: {0}")]
    Other(String),
}

impl DispatchError {
    /// Whether another attempt could succeed.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, DispatchError::InvalidRequest(_))
    }
}

/// Sends one HTTP request per call.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Send the request and return the 2xx status, or the failure.
    async fn dispatch(&self, request: &HttpRequest) -> Result<u16, DispatchError>;
}

/// Production dispatcher backed by `reqwest`.
///
/// Redirects are not followed, so a 3xx answer counts as a failed attempt.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDispatcher {
    /// Create a dispatcher with the given per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DispatchError::Other(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    /// The per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn build(&self, request: &HttpRequest) -> Result<reqwest::RequestBuilder, DispatchError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| DispatchError::InvalidRequest(format!("method '{}': {}", request.method, e)))?;
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| DispatchError::InvalidRequest(format!("url '{}': {}", request.url, e)))?;

        let mut headers = HeaderMap::with_capacity(request.headers.len());
        for (name, value) in &request.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| DispatchError::InvalidRequest(format!("header '{}': {}", name, e)))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| DispatchError::InvalidRequest(format!("header '{}': {}", name, e)))?;
            headers.insert(header_name, header_value);
        }

        Ok(self
            .client
            .request(method, url)
            .headers(headers)
            .body(request.body.clone()))
    }

    fn classify(&self, error: reqwest::Error) -> DispatchError {
        if error.is_timeout() {
            DispatchError::Timeout(self.timeout)
        } else if error.is_connect() {
            DispatchError::Connection(error.to_string())
        } else if error.is_builder() {
            DispatchError::InvalidRequest(error.to_string())
        } else {
            DispatchError::Other(error.to_string())
        }
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, request: &HttpRequest) -> Result<u16, DispatchError> {
        let builder = self.build(request)?;
        let response = builder.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(DispatchError::Status(status.as_u16()))
        }
    }
}
