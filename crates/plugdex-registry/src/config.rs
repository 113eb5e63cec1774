//! Configuration types for registry client.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{RegistryError, Result};
use crate::reference::RegistryIndex;

/// Configuration for the registry client.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Index applied to identifiers without an `INDEX/` segment.
    /// `None` means the official index.
    pub default_index: Option<RegistryIndex>,

    /// Credentials presented to the registry.
    pub auth: AuthInfo,

    /// Per-request transport timeout.
    pub timeout: Duration,

    /// User agent string.
    pub user_agent: String,

    /// Tags requested per page (`n=` parameter).
    pub page_size: u32,

    /// Maximum number of tag pages fetched per listing. `None` is unbounded.
    pub page_limit: Option<usize>,

    /// Maximum in-flight manifest requests when fetching all versions.
    pub concurrency: usize,

    /// Token lifetime used when the issuer does not send `expires_in`.
    pub default_token_ttl: Duration,

    /// Retry policy of the convenience wrappers.
    pub retry: RetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryConfig {
    /// Creates a configuration with default settings.
    ///
    /// # Examples
    ///
    /// ```
    /// use plugdex_registry::RegistryConfig;
    ///
    /// let config = RegistryConfig::new();
    /// assert_eq!(config.concurrency, 8);
    /// assert_eq!(config.page_size, 100);
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self {
            default_index: None,
            auth: AuthInfo::None,
            timeout: Duration::from_secs(30),
            user_agent: format!("plugdex-registry/{}", env!("CARGO_PKG_VERSION")),
            page_size: 100,
            page_limit: None,
            concurrency: 8,
            default_token_ttl: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the index used for identifiers without one.
    #[must_use]
    pub fn with_default_index(mut self, index: RegistryIndex) -> Self {
        self.default_index = Some(index);
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn with_auth(mut self, auth: AuthInfo) -> Self {
        self.auth = auth;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets the tag page size.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Limits the number of tag pages fetched per listing.
    #[must_use]
    pub const fn with_page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = Some(page_limit);
        self
    }

    /// Sets the concurrency cap for version fetching.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the fallback token lifetime.
    #[must_use]
    pub const fn with_default_token_ttl(mut self, ttl: Duration) -> Self {
        self.default_token_ttl = ttl;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Checks the configuration for values that would stall the client.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidConfig`] for a zero concurrency, page
    /// size, page limit or retry attempt count.
    pub fn validate(&self) -> Result<()> {
        let problem = if self.concurrency == 0 {
            Some("concurrency must be at least 1")
        } else if self.page_size == 0 {
            Some("page size must be at least 1")
        } else if self.page_limit == Some(0) {
            Some("page limit must be at least 1")
        } else if self.retry.max_attempts == 0 {
            Some("retry policy needs at least one attempt")
        } else {
            None
        };

        problem.map_or(Ok(()), |message| {
            Err(RegistryError::InvalidConfig {
                message: message.to_string(),
            })
        })
    }
}

/// Credentials, either configured or negotiated.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthInfo {
    /// Anonymous access.
    None,

    /// Basic authentication (username/password or username/token).
    Basic {
        /// Username.
        username: String,
        /// Password or token.
        password: String,
    },

    /// A bearer token.
    Bearer {
        /// Token value.
        token: String,
    },
}

impl AuthInfo {
    /// Creates basic authentication.
    ///
    /// # Examples
    ///
    /// ```
    /// use plugdex_registry::AuthInfo;
    ///
    /// let auth = AuthInfo::basic("user", "pass");
    /// assert!(auth.is_basic());
    /// ```
    #[must_use]
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Creates bearer token authentication.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: token.into(),
        }
    }

    /// Returns true for basic credentials.
    #[must_use]
    pub const fn is_basic(&self) -> bool {
        matches!(self, Self::Basic { .. })
    }

    /// Returns the `Authorization` header value, if any.
    #[must_use]
    pub fn header_value(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Basic { username, password } => {
                let credentials = base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    format!("{username}:{password}"),
                );
                Some(format!("Basic {credentials}"))
            }
            Self::Bearer { token } => Some(format!("Bearer {token}")),
        }
    }
}

// Secrets stay out of logs and panic messages.
impl std::fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// Bounded exponential backoff for the convenience wrappers.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Delay after the first failure.
    pub initial_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Returns the delay to wait after failed attempt number `attempt`
    /// (1-based), honoring a server hint as a lower bound.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use plugdex_registry::RetryPolicy;
    ///
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.delay_for(1, None), Duration::from_millis(200));
    /// assert_eq!(policy.delay_for(2, None), Duration::from_millis(400));
    /// assert_eq!(policy.delay_for(10, None), Duration::from_secs(5));
    /// ```
    #[must_use]
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let backoff = if scaled.is_finite() && scaled < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(scaled.max(0.0))
        } else {
            self.max_delay
        };
        hint.map_or(backoff, |h| backoff.max(h)).min(self.max_delay)
    }
}

/// Per-call deadline and cancellation.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Instant after which the call fails with a timeout error.
    pub deadline: Option<Instant>,

    /// Token that aborts the call when cancelled.
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    /// Options without deadline or cancellation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a deadline `timeout` from now.
    ///
    /// A timeout too large to represent leaves the call without a deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    /// Sets an absolute deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Returns true if the call was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Waits for `delay` unless the call is cancelled or its deadline
    /// passes first.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Cancelled`] or [`RegistryError::Timeout`].
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        self.run("retry backoff", async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }

    /// Runs `fut` under these options.
    ///
    /// A passed deadline yields [`RegistryError::Timeout`] and cancellation
    /// yields [`RegistryError::Cancelled`]; in both cases `fut` is dropped.
    ///
    /// # Errors
    ///
    /// Returns the error of `fut`, or a timeout/cancellation error.
    pub async fn run<F, T>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(RegistryError::Cancelled {
                operation: operation.to_string(),
            });
        }

        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, fut)
                    .await
                    .unwrap_or_else(|_| {
                        Err(RegistryError::Timeout {
                            operation: operation.to_string(),
                        })
                    }),
                None => fut.await,
            }
        };

        match &self.cancel {
            Some(cancel) => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(RegistryError::Cancelled {
                        operation: operation.to_string(),
                    }),
                    result = bounded => result,
                }
            }
            None => bounded.await,
        }
    }
}
