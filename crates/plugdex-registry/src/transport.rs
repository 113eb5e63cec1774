//! HTTP transport abstraction.
//!
//! The registry client never opens sockets itself; every request goes through
//! a [`Transport`] supplied at construction. [`ReqwestTransport`] is the
//! production implementation, tests substitute an in-memory one.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};

use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};
use crate::oci::ErrorResponse;

/// An outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,

    /// Absolute URL.
    pub url: String,

    /// Request headers.
    pub headers: HeaderMap,
}

impl HttpRequest {
    /// Creates a `GET` request without headers.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Adds a header, ignoring values that are not valid header text.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Returns a header value as text.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code.
    pub status: StatusCode,

    /// Response headers.
    pub headers: HeaderMap,

    /// Raw body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response with the given status and body.
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Adds a header, ignoring values that are not valid header text.
    #[must_use]
    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.append(HeaderName::from_static(name), value);
        }
        self
    }

    /// Returns a header value as text.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns true for 2xx responses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns the body as lossy UTF-8 text.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parses the `Retry-After` header, given either in seconds or as an
    /// HTTP date. A date in the past yields zero.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        let value = self.header("retry-after")?.trim();
        if let Ok(secs) = value.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        let at = DateTime::parse_from_rfc2822(value).ok()?;
        Some((at.with_timezone(&Utc) - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Maps a non-2xx response to the matching error.
    pub(crate) fn to_error(&self, what: &str) -> RegistryError {
        let errors = ErrorResponse::parse(&self.body).errors;
        match self.status {
            StatusCode::NOT_FOUND => RegistryError::NotFound {
                what: what.to_string(),
                errors,
            },
            StatusCode::TOO_MANY_REQUESTS => RegistryError::RateLimited {
                retry_after: self.retry_after(),
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                RegistryError::AuthenticationFailed {
                    message: errors.first().map_or_else(
                        || format!("{what}: {}", self.status),
                        |e| format!("{what}: {}", e.message),
                    ),
                }
            }
            status => RegistryError::HttpError {
                status: status.as_u16(),
                message: errors
                    .first()
                    .filter(|e| !e.message.is_empty())
                    .map_or_else(
                        || status.canonical_reason().unwrap_or("unknown status").to_string(),
                        |e| e.message.clone(),
                    ),
                errors,
                body: self.text(),
            },
        }
    }
}

/// Performs HTTP calls on behalf of the registry client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` and buffers the full response.
    ///
    /// Non-2xx statuses are returned as responses, not errors.
    ///
    /// # Errors
    ///
    /// Returns an error only when no response was received.
    async fn call(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// [`Transport`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds the HTTP client from the registry configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| RegistryError::InvalidConfig {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }

    /// Wraps an existing `reqwest` client.
    #[must_use]
    pub const fn from_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn call(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self
            .http
            .request(request.method, &request.url)
            .headers(request.headers)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        tracing::trace!(url = %request.url, status = status.as_u16(), bytes = body.len(), "registry response");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
