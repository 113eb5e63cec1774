//! Versions command implementation.

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use plugdex_registry::{fetch_versions, PluginRecord};

use super::RegistryArgs;

/// Arguments for the versions command.
#[derive(Args)]
pub struct VersionsArgs {
    /// Repository such as `ghcr.io/acme/linter`
    pub repository: String,

    /// Fail if any tag could not be read
    #[arg(long)]
    pub strict: bool,
}

/// Runs the versions command, printing the plugin record as JSON.
///
/// # Errors
///
/// Returns an error if the tag list cannot be read, or with `--strict` if
/// any tag failed.
pub async fn run(registry: &RegistryArgs, args: &VersionsArgs) -> Result<()> {
    let client = registry.client()?;
    let repo = client.parse_repo(&args.repository)?;
    let options = registry.request_options();

    info!(repository = %repo, "Fetching versions");
    let report = fetch_versions(&client, &repo, &options)
        .await
        .context("Failed to fetch versions")?;

    for failure in &report.failures {
        warn!(reference = %failure.tag, error = %failure.error, "Tag left out");
    }
    if args.strict && !report.is_complete() {
        anyhow::bail!(
            "{} tag(s) of {} could not be read",
            report.failures.len(),
            repo
        );
    }

    let record = PluginRecord::new(&repo, report.versions);
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
