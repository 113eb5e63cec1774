//! Error types for registry operations.
//!
//! Every failure carries a machine-readable [`ErrorKind`] so that callers can
//! map errors to exit codes or per-plugin sync reports without matching on
//! message text.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::oci::RegistryApiError;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Machine-readable classification of a [`RegistryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed identifier, digest or configuration value.
    Format,
    /// Credentials rejected after the bounded re-authentication.
    Auth,
    /// Malformed server response (bad JSON, bad `Link` header, bad challenge).
    Protocol,
    /// Content digest verification failed.
    DigestMismatch,
    /// Legacy schema or unknown manifest media type.
    UnsupportedManifest,
    /// Non-2xx response not covered by a more specific kind.
    Http,
    /// The registry answered 404.
    NotFound,
    /// The registry answered 429.
    RateLimit,
    /// The caller's deadline elapsed.
    Timeout,
    /// Connection-level transport failure.
    Network,
    /// The caller cancelled the operation.
    Cancelled,
}

impl ErrorKind {
    /// Returns the stable name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Format => "format_error",
            Self::Auth => "auth_error",
            Self::Protocol => "protocol_error",
            Self::DigestMismatch => "digest_mismatch_error",
            Self::UnsupportedManifest => "unsupported_manifest_error",
            Self::Http => "http_error",
            Self::NotFound => "not_found_error",
            Self::RateLimit => "rate_limit_error",
            Self::Timeout => "timeout_error",
            Self::Network => "network_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Invalid reference format.
    #[error("Invalid reference '{input}': {message}")]
    InvalidReference {
        /// The rejected input.
        input: String,
        /// What is wrong with it.
        message: String,
    },

    /// Invalid client configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },

    /// Invalid URL.
    #[error("Invalid URL: {url}")]
    InvalidUrl {
        /// URL string.
        url: String,
    },

    /// Authentication failed.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed {
        /// Error message.
        message: String,
    },

    /// The registry sent something that does not follow the protocol.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message.
        message: String,
        /// Tags gathered before pagination broke off.
        partial_tags: Vec<String>,
    },

    /// JSON deserialization error.
    #[error("JSON error: {source}")]
    JsonError {
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// Digest of the fetched content does not match the advertised digest.
    #[error("Digest mismatch for {reference}: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Reference that was fetched.
        reference: String,
        /// Advertised digest.
        expected: String,
        /// Computed digest.
        actual: String,
    },

    /// Manifest schema or media type is not supported.
    #[error("Unsupported manifest: {message}")]
    UnsupportedManifest {
        /// Media type, when one was advertised.
        media_type: Option<String>,
        /// Error message.
        message: String,
    },

    /// Resource not found in registry.
    #[error("Not found: {what}")]
    NotFound {
        /// What was requested.
        what: String,
        /// Errors reported by the registry.
        errors: Vec<RegistryApiError>,
    },

    /// Registry is throttling requests.
    #[error("Rate limited by registry{}", .retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited {
        /// Hint from the `Retry-After` header.
        retry_after: Option<Duration>,
    },

    /// HTTP error from registry.
    #[error("HTTP error from registry: {status} - {message}")]
    HttpError {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
        /// Parsed registry error list.
        errors: Vec<RegistryApiError>,
        /// Raw response body.
        body: String,
    },

    /// The caller's deadline elapsed.
    #[error("Operation timed out: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// Failed to connect to registry.
    #[error("Failed to connect to registry at {url}: {source}")]
    ConnectionFailed {
        /// Registry URL.
        url: String,
        /// Underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The caller cancelled the operation.
    #[error("Operation cancelled: {operation}")]
    Cancelled {
        /// The operation that was cancelled.
        operation: String,
    },
}

impl RegistryError {
    /// Creates a protocol error without partial results.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            partial_tags: Vec::new(),
        }
    }

    /// Creates an invalid reference error.
    #[must_use]
    pub fn invalid_reference(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidReference {
            input: input.into(),
            message: message.into(),
        }
    }

    /// Returns the machine-readable kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidReference { .. } | Self::InvalidConfig { .. } | Self::InvalidUrl { .. } => {
                ErrorKind::Format
            }
            Self::AuthenticationFailed { .. } => ErrorKind::Auth,
            Self::Protocol { .. } | Self::JsonError { .. } => ErrorKind::Protocol,
            Self::DigestMismatch { .. } => ErrorKind::DigestMismatch,
            Self::UnsupportedManifest { .. } => ErrorKind::UnsupportedManifest,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::HttpError { .. } => ErrorKind::Http,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ConnectionFailed { .. } => ErrorKind::Network,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Returns true if a convenience wrapper may retry after this error.
    ///
    /// Auth failures are not retryable here: the request chain already spent
    /// its single re-authentication.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::ConnectionFailed { .. } | Self::RateLimited { .. } => true,
            Self::HttpError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns the retry-after hint of a rate limit error.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Returns the registry error list carried by this error, if any.
    #[must_use]
    pub fn api_errors(&self) -> &[RegistryApiError] {
        match self {
            Self::HttpError { errors, .. } | Self::NotFound { errors, .. } => errors,
            _ => &[],
        }
    }

    /// Returns the first registry error code, e.g. `MANIFEST_UNKNOWN`.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.api_errors().first().map(|e| e.code.as_str())
    }

    /// Returns the tags gathered before a pagination failure.
    #[must_use]
    pub fn partial_tags(&self) -> &[String] {
        match self {
            Self::Protocol { partial_tags, .. } => partial_tags,
            _ => &[],
        }
    }

    /// Returns the process exit code a CLI should use for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Format => 2,
            ErrorKind::Auth => 3,
            ErrorKind::NotFound => 4,
            ErrorKind::DigestMismatch => 5,
            ErrorKind::UnsupportedManifest => 6,
            ErrorKind::Protocol => 7,
            ErrorKind::Http => 8,
            ErrorKind::RateLimit => 9,
            ErrorKind::Timeout => 10,
            ErrorKind::Network => 11,
            ErrorKind::Cancelled => 130,
        }
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map_or_else(|| "unknown".to_string(), ToString::to_string);
        if err.is_timeout() {
            Self::Timeout { operation: url }
        } else {
            Self::ConnectionFailed {
                url,
                source: Box::new(err),
            }
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError { source: err }
    }
}

impl From<url::ParseError> for RegistryError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl {
            url: err.to_string(),
        }
    }
}
