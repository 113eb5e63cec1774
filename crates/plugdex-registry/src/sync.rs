//! Marketplace sync entry points.
//!
//! These wrap the low-level client operations, which fail fast, with the
//! policies a sync run needs: bounded retries, a concurrency cap on manifest
//! requests, and failure isolation per tag and per plugin.

use std::future::Future;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::client::ManifestClient;
use crate::config::{RequestOptions, RetryPolicy};
use crate::error::{ErrorKind, RegistryError, Result};
use crate::reference::{normalize, RegistryRepo};
use crate::version::{group_versions_by_sha, GroupedVersion, RawVersion};

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are spent.
///
/// The delay between attempts grows exponentially; a rate limit's
/// retry-after hint is used as the minimum delay. The wait between attempts
/// honours the cancellation and deadline of `options`.
///
/// # Errors
///
/// Returns the error of the last attempt, or a cancellation/timeout error
/// raised while waiting.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    options: &RequestOptions,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt, e.retry_after());
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "registry request failed, retrying"
                );
                options.sleep(delay).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// A tag whose metadata could not be fetched.
#[derive(Debug)]
pub struct TagFailure {
    /// The tag.
    pub tag: String,

    /// Why it failed.
    pub error: RegistryError,
}

/// Versions of one repository plus the tags that could not be read.
#[derive(Debug, Default)]
pub struct VersionFetchReport {
    /// Reconciled versions, highest priority first.
    pub versions: Vec<GroupedVersion>,

    /// Per-tag failures; these tags are missing from `versions`.
    pub failures: Vec<TagFailure>,
}

impl VersionFetchReport {
    /// Returns true if every tag was read.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Lists every tag of `repo`, reads each tag's manifest, and reconciles the
/// results.
///
/// At most `concurrency` manifest requests are in flight. Results keep tag
/// order, so which tag's metadata represents a shared digest is
/// deterministic.
///
/// # Errors
///
/// Fails when the tag list cannot be read or the call is cancelled. Other
/// per-tag errors are collected in [`VersionFetchReport::failures`].
pub async fn fetch_versions(
    client: &ManifestClient,
    repo: &RegistryRepo,
    options: &RequestOptions,
) -> Result<VersionFetchReport> {
    let policy = &client.config().retry;
    let concurrency = client.config().concurrency;

    let tags = with_retry(policy, options, || async move {
        client.list_tags(repo, options).collect_tags().await
    })
    .await?;
    tracing::debug!(repository = %repo, tags = tags.len(), "listed tags");

    let results: Vec<(String, Result<RawVersion>)> = stream::iter(tags)
        .map(move |tag| async move {
            let result = with_retry(policy, options, || client.query_tag_metadata(repo, &tag, options)).await;
            (tag, result)
        })
        .buffered(concurrency)
        .collect()
        .await;

    let mut raw_versions = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for (tag, result) in results {
        match result {
            Ok(raw) => raw_versions.push(raw),
            Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
            Err(e) => {
                tracing::warn!(repository = %repo, reference = %tag, error = %e, "skipping tag");
                failures.push(TagFailure { tag, error: e });
            }
        }
    }

    Ok(VersionFetchReport {
        versions: group_versions_by_sha(&raw_versions),
        failures,
    })
}

/// Marketplace entry for one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    /// Last path segment of the repository name.
    pub name: String,

    /// Canonical repository name.
    pub reference: String,

    /// Canonical tag of the highest-priority version.
    pub latest: Option<String>,

    /// Reconciled versions, highest priority first.
    pub versions: Vec<GroupedVersion>,
}

impl PluginRecord {
    /// Builds the record of `repo` from its reconciled versions.
    #[must_use]
    pub fn new(repo: &RegistryRepo, versions: Vec<GroupedVersion>) -> Self {
        Self {
            name: repo
                .remote_name
                .rsplit_once('/')
                .map_or(repo.remote_name.as_str(), |(_, name)| name)
                .to_string(),
            reference: repo.canonical_name.clone(),
            latest: versions.first().map(|v| v.canonical_tag.clone()),
            versions,
        }
    }
}

/// Result of syncing one plugin of a batch.
#[derive(Debug)]
pub enum PluginSyncOutcome {
    /// The plugin was read; some tags may have failed.
    Synced {
        /// Identifier as given.
        plugin: String,
        /// The plugin's record.
        record: PluginRecord,
        /// Tags left out of the record.
        failures: Vec<TagFailure>,
    },

    /// The plugin could not be read at all.
    Failed {
        /// Identifier as given.
        plugin: String,
        /// Why it failed.
        error: RegistryError,
    },
}

impl PluginSyncOutcome {
    /// Identifier of the plugin as given to [`sync_plugins`].
    #[must_use]
    pub fn plugin(&self) -> &str {
        match self {
            Self::Synced { plugin, .. } | Self::Failed { plugin, .. } => plugin,
        }
    }

    /// Returns true if the plugin was read.
    #[must_use]
    pub const fn is_synced(&self) -> bool {
        matches!(self, Self::Synced { .. })
    }

    /// Returns the record of a synced plugin.
    #[must_use]
    pub const fn record(&self) -> Option<&PluginRecord> {
        match self {
            Self::Synced { record, .. } => Some(record),
            Self::Failed { .. } => None,
        }
    }

    /// Returns the error of a failed plugin.
    #[must_use]
    pub const fn error(&self) -> Option<&RegistryError> {
        match self {
            Self::Synced { .. } => None,
            Self::Failed { error, .. } => Some(error),
        }
    }
}

/// Syncs a batch of plugins given as `registry/owner/name` identifiers.
///
/// Plugins are processed concurrently and independently: an invalid
/// identifier or failing registry only affects its own outcome. Outcomes are
/// returned in input order.
pub async fn sync_plugins<S: AsRef<str>>(
    client: &ManifestClient,
    plugins: &[S],
    options: &RequestOptions,
) -> Vec<PluginSyncOutcome> {
    let futures: Vec<_> = plugins
        .iter()
        .map(|plugin| sync_plugin(client, plugin.as_ref(), options))
        .collect();

    let outcomes = futures::future::join_all(futures).await;

    let synced = outcomes.iter().filter(|o| o.is_synced()).count();
    tracing::info!(
        plugins = outcomes.len(),
        synced,
        failed = outcomes.len() - synced,
        "plugin sync finished"
    );
    outcomes
}

async fn sync_plugin(client: &ManifestClient, plugin: &str, options: &RequestOptions) -> PluginSyncOutcome {
    let repo = match normalize(plugin).and_then(|id| client.parse_repo(&id)) {
        Ok(repo) => repo,
        Err(error) => {
            tracing::warn!(plugin, error = %error, "invalid plugin identifier");
            return PluginSyncOutcome::Failed {
                plugin: plugin.to_string(),
                error,
            };
        }
    };

    match fetch_versions(client, &repo, options).await {
        Ok(report) => {
            tracing::info!(
                repository = %repo,
                versions = report.versions.len(),
                failed_tags = report.failures.len(),
                "synced plugin"
            );
            PluginSyncOutcome::Synced {
                plugin: plugin.to_string(),
                record: PluginRecord::new(&repo, report.versions),
                failures: report.failures,
            }
        }
        Err(error) => {
            tracing::warn!(repository = %repo, error = %error, "plugin sync failed");
            PluginSyncOutcome::Failed {
                plugin: plugin.to_string(),
                error,
            }
        }
    }
}
