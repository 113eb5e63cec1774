//! Docker Registry v2 challenge/response authentication.
//!
//! A request first goes out with whatever the negotiator already knows for
//! its `(host, scope)`. A `401` carries a `WWW-Authenticate` challenge which
//! is recorded here; `Basic` challenges are answered with the configured
//! credentials, `Bearer` challenges with a token from the challenge's realm.
//!
//! Tokens are cached per `(realm, service, scope)`. Each key has its own async
//! lock, so concurrent requests for the same scope share a single token
//! request while different scopes proceed independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use tokio::time::Instant;
use url::Url;

use crate::config::AuthInfo;
use crate::error::{RegistryError, Result};
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// Authentication scheme of a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthScheme {
    /// `Basic`: credentials are sent with every request.
    Basic,
    /// `Bearer`: a token is obtained from the realm.
    Bearer,
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Challenge scheme.
    pub scheme: AuthScheme,

    /// Realm; the token endpoint URL for `Bearer`.
    pub realm: String,

    /// Service the token is issued for.
    pub service: Option<String>,

    /// Scope requested by the registry.
    pub scope: Option<String>,
}

impl Challenge {
    /// Parses a `WWW-Authenticate` header value.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for unknown schemes, malformed parameters, or
    /// a `Bearer` challenge without a realm.
    ///
    /// # Examples
    ///
    /// ```
    /// use plugdex_registry::{AuthScheme, Challenge};
    ///
    /// let challenge = Challenge::parse(
    ///     r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:owner/repo:pull""#,
    /// )
    /// .unwrap();
    /// assert_eq!(challenge.scheme, AuthScheme::Bearer);
    /// assert_eq!(challenge.realm, "https://ghcr.io/token");
    /// ```
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let (scheme, params) = header
            .split_once(char::is_whitespace)
            .unwrap_or((header, ""));

        let scheme = if scheme.eq_ignore_ascii_case("bearer") {
            AuthScheme::Bearer
        } else if scheme.eq_ignore_ascii_case("basic") {
            AuthScheme::Basic
        } else {
            return Err(RegistryError::protocol(format!(
                "unsupported authentication scheme '{scheme}'"
            )));
        };

        let params = parse_auth_params(params)?;
        let realm = params.get("realm").cloned();
        if scheme == AuthScheme::Bearer && realm.as_deref().map_or(true, str::is_empty) {
            return Err(RegistryError::protocol("bearer challenge has no realm"));
        }

        Ok(Self {
            scheme,
            realm: realm.unwrap_or_default(),
            service: params.get("service").cloned(),
            scope: params.get("scope").cloned(),
        })
    }
}

/// Parses `key=value, key="quoted, value"` lists. Keys are lowercased.
fn parse_auth_params(input: &str) -> Result<HashMap<String, String>> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let key: String = std::iter::from_fn(|| chars.next_if(|c| *c != '=' && *c != ','))
            .collect::<String>()
            .trim()
            .to_ascii_lowercase();
        if chars.next() != Some('=') || key.is_empty() {
            return Err(RegistryError::protocol(format!(
                "malformed challenge parameters: {input}"
            )));
        }

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let value = if chars.peek() == Some(&'"') {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => value.extend(chars.next()),
                    Some(c) => value.push(c),
                    None => {
                        return Err(RegistryError::protocol(format!(
                            "unterminated quoted value in challenge: {input}"
                        )))
                    }
                }
            }
            value
        } else {
            std::iter::from_fn(|| chars.next_if(|c| *c != ','))
                .collect::<String>()
                .trim()
                .to_string()
        };

        params.insert(key, value);
    }

    Ok(params)
}

/// Cache key of a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    /// Token endpoint.
    pub realm: String,
    /// Service parameter.
    pub service: String,
    /// Scope parameter.
    pub scope: String,
}

/// Observable negotiation state for one `(host, scope)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// No challenge seen yet.
    Unauthenticated,
    /// A challenge was recorded but no credential is ready.
    ChallengeReceived(Challenge),
    /// A credential is ready to be presented.
    Authenticated(AuthInfo),
}

/// Value for the `Authorization` header plus where it came from.
#[derive(Clone)]
pub(crate) struct Authorization {
    pub(crate) header: String,
    token_key: Option<TokenKey>,
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorization")
            .field("token_key", &self.token_key)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl std::fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedToken")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

type TokenSlot = Arc<tokio::sync::Mutex<Option<CachedToken>>>;

/// Upper bound on how long an issued token is trusted.
const MAX_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Negotiates credentials with registries and owns the token cache.
#[derive(Debug)]
pub struct AuthNegotiator {
    credentials: AuthInfo,
    default_ttl: Duration,
    challenges: parking_lot::Mutex<HashMap<(String, String), Challenge>>,
    tokens: parking_lot::Mutex<HashMap<TokenKey, TokenSlot>>,
}

impl AuthNegotiator {
    /// Creates a negotiator presenting `credentials`.
    ///
    /// `default_ttl` applies to tokens issued without `expires_in`.
    #[must_use]
    pub fn new(credentials: AuthInfo, default_ttl: Duration) -> Self {
        Self {
            credentials,
            default_ttl,
            challenges: parking_lot::Mutex::new(HashMap::new()),
            tokens: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Returns the configured credentials.
    #[must_use]
    pub const fn credentials(&self) -> &AuthInfo {
        &self.credentials
    }

    /// Reports the negotiation state for a request scope on `host`.
    #[must_use]
    pub fn state(&self, host: &str, scope: &str) -> AuthState {
        if matches!(self.credentials, AuthInfo::Bearer { .. }) {
            return AuthState::Authenticated(self.credentials.clone());
        }

        let Some(challenge) = self.challenge_for(host, scope) else {
            return AuthState::Unauthenticated;
        };

        match challenge.scheme {
            AuthScheme::Basic if self.credentials.is_basic() => {
                AuthState::Authenticated(self.credentials.clone())
            }
            AuthScheme::Basic => AuthState::ChallengeReceived(challenge),
            AuthScheme::Bearer => {
                let slot = self.tokens.lock().get(&token_key(&challenge, scope)).cloned();
                slot.as_ref().and_then(fresh_token).map_or(AuthState::ChallengeReceived(challenge), |token| {
                    AuthState::Authenticated(AuthInfo::Bearer { token })
                })
            }
        }
    }

    /// Returns the `Authorization` value to attach for `scope` on `host`,
    /// fetching a bearer token when a challenge requires one.
    ///
    /// Returns `None` while no challenge has been seen and no static token is
    /// configured.
    pub(crate) async fn authorization(
        &self,
        transport: &dyn Transport,
        host: &str,
        scope: &str,
    ) -> Result<Option<Authorization>> {
        if let AuthInfo::Bearer { .. } = &self.credentials {
            return Ok(self.credentials.header_value().map(|header| Authorization {
                header,
                token_key: None,
            }));
        }

        let Some(challenge) = self.challenge_for(host, scope) else {
            return Ok(None);
        };

        match challenge.scheme {
            AuthScheme::Basic => match self.credentials.header_value() {
                Some(header) => Ok(Some(Authorization {
                    header,
                    token_key: None,
                })),
                None => Err(RegistryError::AuthenticationFailed {
                    message: format!("{host} requires basic credentials"),
                }),
            },
            AuthScheme::Bearer => {
                let key = token_key(&challenge, scope);
                let token = self.token(transport, &key).await?;
                Ok(Some(Authorization {
                    header: format!("Bearer {token}"),
                    token_key: Some(key),
                }))
            }
        }
    }

    /// Records a challenge received for `scope` on `host`.
    ///
    /// When the rejected request carried a cached token, that token is purged
    /// so the next [`authorization`](Self::authorization) negotiates afresh.
    pub(crate) async fn record_challenge(
        &self,
        host: &str,
        scope: &str,
        challenge: Challenge,
        rejected: Option<&Authorization>,
    ) {
        tracing::debug!(
            host,
            scope,
            scheme = ?challenge.scheme,
            realm = %challenge.realm,
            "received authentication challenge"
        );

        if let Some(key) = rejected.and_then(|a| a.token_key.as_ref()) {
            let slot = self.tokens.lock().get(key).cloned();
            if let Some(slot) = slot {
                let mut cached = slot.lock().await;
                let rejected_token = rejected.and_then(|a| a.header.strip_prefix("Bearer "));
                if cached.is_some() && cached.as_ref().map(|t| t.token.as_str()) == rejected_token {
                    tracing::debug!(realm = %key.realm, scope = %key.scope, "purging rejected token");
                    *cached = None;
                }
            }
        }

        self.challenges
            .lock()
            .insert((host.to_string(), scope.to_string()), challenge);
    }

    /// Drops every cached token and challenge.
    pub fn clear(&self) {
        self.tokens.lock().clear();
        self.challenges.lock().clear();
    }

    fn challenge_for(&self, host: &str, scope: &str) -> Option<Challenge> {
        self.challenges
            .lock()
            .get(&(host.to_string(), scope.to_string()))
            .cloned()
    }

    /// Returns a fresh token for `key`, requesting one if needed.
    ///
    /// The per-key lock is held across the token request; a waiter finds the
    /// token already cached once it gets the lock.
    async fn token(&self, transport: &dyn Transport, key: &TokenKey) -> Result<String> {
        let slot = {
            let mut tokens = self.tokens.lock();
            // Slots nobody holds and whose token is gone or expired are dead.
            tokens.retain(|k, slot| {
                k == key || Arc::strong_count(slot) > 1 || fresh_token(slot).is_some()
            });
            tokens.entry(key.clone()).or_default().clone()
        };
        let mut cached = slot.lock().await;

        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.token.clone());
        }

        let fetched = self.fetch_token(transport, key).await?;
        let token = fetched.token.clone();
        *cached = Some(fetched);
        Ok(token)
    }

    async fn fetch_token(&self, transport: &dyn Transport, key: &TokenKey) -> Result<CachedToken> {
        let mut url = Url::parse(&key.realm).map_err(|_| {
            RegistryError::protocol(format!("challenge realm is not a URL: {}", key.realm))
        })?;
        {
            let mut query = url.query_pairs_mut();
            if !key.service.is_empty() {
                query.append_pair("service", &key.service);
            }
            if !key.scope.is_empty() {
                query.append_pair("scope", &key.scope);
            }
        }

        let mut request = HttpRequest::get(url.as_str());
        if self.credentials.is_basic() {
            if let Some(header) = self.credentials.header_value() {
                request = request.with_header(AUTHORIZATION, &header);
            }
        }

        tracing::debug!(realm = %key.realm, service = %key.service, scope = %key.scope, "requesting bearer token");
        let response = transport.call(request).await?;
        parse_token_response(&response, self.default_ttl)
    }
}

/// Returns the cached token if it is fresh and no fetch holds the slot.
fn fresh_token(slot: &TokenSlot) -> Option<String> {
    let cached = slot.try_lock().ok()?;
    cached.as_ref().filter(|t| t.is_fresh()).map(|t| t.token.clone())
}

fn token_key(challenge: &Challenge, scope: &str) -> TokenKey {
    TokenKey {
        realm: challenge.realm.clone(),
        service: challenge.service.clone().unwrap_or_default(),
        scope: challenge.scope.clone().unwrap_or_else(|| scope.to_string()),
    }
}

fn parse_token_response(response: &HttpResponse, default_ttl: Duration) -> Result<CachedToken> {
    match response.status.as_u16() {
        200..=299 => {}
        401 | 403 => {
            return Err(RegistryError::AuthenticationFailed {
                message: format!("token endpoint answered {}: {}", response.status, response.text()),
            })
        }
        _ => return Err(response.to_error("token")),
    }

    let body: TokenResponse = serde_json::from_slice(&response.body)?;
    let token = body
        .token
        .filter(|t| !t.is_empty())
        .or(body.access_token.filter(|t| !t.is_empty()))
        .ok_or_else(|| RegistryError::protocol("token response has neither token nor access_token"))?;
    let ttl = body
        .expires_in
        .filter(|secs| *secs > 0)
        .map_or(default_ttl, Duration::from_secs)
        .min(MAX_TOKEN_TTL);
    let now = Instant::now();

    Ok(CachedToken {
        token,
        expires_at: now.checked_add(ttl).unwrap_or(now),
    })
}
