//! OCI Distribution API client for plugin registry operations.
//!
//! This module provides the read-only client used to enumerate plugin
//! releases: tag listing, manifest fetching with digest verification, and
//! per-tag metadata extraction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use tokio::sync::Semaphore;

use crate::auth::{AuthNegotiator, Challenge};
use crate::config::{RegistryConfig, RequestOptions};
use crate::error::{RegistryError, Result};
use crate::oci::{compute_digest, is_valid_digest, Manifest, MediaType, ANNOTATION_CREATED};
use crate::pagination::TagPager;
use crate::reference::{self, is_valid_tag, RegistryImage, RegistryRepo};
use crate::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
use crate::version::RawVersion;

/// A manifest together with its verified digest.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    /// The parsed manifest.
    pub manifest: Manifest,

    /// SHA-256 digest of the raw response body.
    pub digest: String,

    /// Response headers.
    pub headers: HeaderMap,
}

/// Client for reading plugin releases from OCI-compatible registries.
///
/// Clones share one token cache and one pool of `concurrency` request
/// permits, so the cap holds across every operation of every clone.
#[derive(Clone)]
pub struct ManifestClient {
    config: RegistryConfig,
    transport: Arc<dyn Transport>,
    auth: Arc<AuthNegotiator>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for ManifestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestClient")
            .field("config", &self.config)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl ManifestClient {
    /// Creates a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be created.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use plugdex_registry::{ManifestClient, RegistryConfig};
    ///
    /// let client = ManifestClient::new(RegistryConfig::new())?;
    /// # Ok::<(), plugdex_registry::RegistryError>(())
    /// ```
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(&config)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Creates a client that sends every request through `transport`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_transport(config: RegistryConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let auth = AuthNegotiator::new(config.auth.clone(), config.default_token_ttl);
        let permits = Semaphore::new(config.concurrency.min(Semaphore::MAX_PERMITS));
        Ok(Self {
            config,
            transport,
            auth: Arc::new(auth),
            permits: Arc::new(permits),
        })
    }

    /// Returns the registry configuration.
    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Returns the authentication negotiator shared by clones of this client.
    #[must_use]
    pub fn auth(&self) -> &AuthNegotiator {
        &self.auth
    }

    /// Parses a repository identifier against the configured default index.
    ///
    /// # Errors
    ///
    /// Returns a format error for invalid identifiers.
    pub fn parse_repo(&self, arg: &str) -> Result<RegistryRepo> {
        reference::parse_repo(arg, self.config.default_index.as_ref())
    }

    /// Parses an image reference against the configured default index.
    ///
    /// # Errors
    ///
    /// Returns a format error for invalid identifiers.
    pub fn parse_image(&self, arg: &str) -> Result<RegistryImage> {
        reference::parse_repo_and_ref(arg, self.config.default_index.as_ref())
    }

    /// Lists the tags of a repository page by page.
    ///
    /// No request is made until the first [`TagPager::next_page`] call.
    #[must_use]
    pub fn list_tags(&self, repo: &RegistryRepo, options: &RequestOptions) -> TagPager<'_> {
        TagPager::new(self, repo.clone(), options.clone())
    }

    /// Fetches one tag page from `url`.
    pub(crate) async fn fetch_tag_page(
        &self,
        repo: &RegistryRepo,
        url: &str,
        options: &RequestOptions,
    ) -> Result<HttpResponse> {
        let request = HttpRequest::get(url).with_header(ACCEPT, "application/json");
        let what = format!("tags of {repo}");
        options.run("list tags", self.send(repo, request, &what)).await
    }

    /// Fetches and verifies a manifest by tag or digest.
    ///
    /// The SHA-256 of the body must match `Docker-Content-Digest` when the
    /// registry sends one, and must match `reference` when it is a digest.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DigestMismatch`] when verification fails,
    /// [`RegistryError::UnsupportedManifest`] for schema 1 or unknown media
    /// types, and the mapped request error otherwise.
    pub async fn get_manifest(
        &self,
        repo: &RegistryRepo,
        reference: &str,
        options: &RequestOptions,
    ) -> Result<FetchedManifest> {
        let reference_is_digest = is_valid_digest(reference);
        if !reference_is_digest && !is_valid_tag(reference) {
            return Err(RegistryError::invalid_reference(
                reference,
                "not a valid tag or digest",
            ));
        }

        let url = format!(
            "{}/v2/{}/manifests/{reference}",
            repo.index.base_url(),
            repo.remote_name
        );
        let request = HttpRequest::get(url).with_header(ACCEPT, &MediaType::accept_header());
        let what = format!("manifest {repo}:{reference}");

        tracing::debug!(repository = %repo, reference, "fetching manifest");
        let response = options
            .run("get manifest", self.send(repo, request, &what))
            .await?;

        let digest = compute_digest(&response.body);
        if let Some(advertised) = response.header("docker-content-digest") {
            verify_digest(repo, reference, advertised.trim(), &digest)?;
        }
        if reference_is_digest {
            verify_digest(repo, reference, reference, &digest)?;
        }

        let manifest = Manifest::from_slice(&response.body, response.header("content-type"))?;
        tracing::debug!(
            repository = %repo,
            reference,
            digest = %digest,
            media_type = manifest.media_type().map(MediaType::as_str),
            "fetched manifest"
        );

        Ok(FetchedManifest {
            manifest,
            digest,
            headers: response.headers,
        })
    }

    /// Fetches the manifest an image reference points at.
    ///
    /// # Errors
    ///
    /// See [`get_manifest`](Self::get_manifest).
    pub async fn get_image_manifest(
        &self,
        image: &RegistryImage,
        options: &RequestOptions,
    ) -> Result<FetchedManifest> {
        self.get_manifest(&image.repo, image.reference(), options).await
    }

    /// Builds the [`RawVersion`] of one tag from its manifest.
    ///
    /// # Errors
    ///
    /// See [`get_manifest`](Self::get_manifest).
    pub async fn query_tag_metadata(
        &self,
        repo: &RegistryRepo,
        tag: &str,
        options: &RequestOptions,
    ) -> Result<RawVersion> {
        let fetched = self.get_manifest(repo, tag, options).await?;
        let annotations = fetched.manifest.annotations().cloned().unwrap_or_default();

        let published_at = annotations.get(ANNOTATION_CREATED).and_then(|created| {
            match DateTime::parse_from_rfc3339(created) {
                Ok(at) => Some(at.with_timezone(&Utc)),
                Err(e) => {
                    tracing::warn!(
                        repository = %repo,
                        reference = tag,
                        value = %created,
                        error = %e,
                        "ignoring unparsable creation timestamp"
                    );
                    None
                }
            }
        });

        Ok(RawVersion {
            tag: tag.to_string(),
            sha: fetched.digest,
            published_at,
            size: fetched.manifest.layers_size(),
            annotations,
        })
    }

    /// Sends a request with authentication.
    ///
    /// Each attempt waits for a request permit. A `401` records the
    /// challenge and retries once with fresh credentials; a second `401` is
    /// an authentication failure.
    async fn send(&self, repo: &RegistryRepo, request: HttpRequest, what: &str) -> Result<HttpResponse> {
        let host = repo.index.name.as_str();
        let scope = repo.pull_scope();
        let mut reauthenticated = false;

        loop {
            // Held across token negotiation and the request itself.
            let _permit = self.permits.acquire().await.map_err(|_| RegistryError::Cancelled {
                operation: what.to_string(),
            })?;

            let authorization = self
                .auth
                .authorization(self.transport.as_ref(), host, &scope)
                .await?;

            let mut attempt = request.clone();
            if let Some(auth) = &authorization {
                attempt = attempt.with_header(AUTHORIZATION, &auth.header);
            }

            tracing::debug!(url = %attempt.url, authenticated = authorization.is_some(), "sending registry request");
            let response = self.transport.call(attempt).await?;

            if response.status != StatusCode::UNAUTHORIZED {
                return if response.is_success() {
                    Ok(response)
                } else {
                    Err(response.to_error(what))
                };
            }

            if reauthenticated {
                return Err(RegistryError::AuthenticationFailed {
                    message: format!("{host} rejected credentials for {what}"),
                });
            }

            let challenge = response
                .header("www-authenticate")
                .ok_or_else(|| RegistryError::AuthenticationFailed {
                    message: format!("{host} answered 401 without a challenge for {what}"),
                })
                .and_then(Challenge::parse)?;

            self.auth
                .record_challenge(host, &scope, challenge, authorization.as_ref())
                .await;
            reauthenticated = true;
        }
    }
}

/// Checks a computed digest against an expected one.
///
/// Only `sha256` digests can be checked; other algorithms are skipped.
fn verify_digest(repo: &RegistryRepo, reference: &str, expected: &str, actual: &str) -> Result<()> {
    if !expected.starts_with("sha256:") {
        tracing::debug!(repository = %repo, reference, expected, "skipping non-sha256 digest check");
        return Ok(());
    }
    if expected == actual {
        Ok(())
    } else {
        Err(RegistryError::DigestMismatch {
            reference: format!("{repo}:{reference}"),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}
