//! Sync command implementation.
//!
//! Syncs several plugins at once. Each plugin succeeds or fails on its own;
//! the command exits non-zero if any of them failed.

use anyhow::Result;
use clap::Args;

use plugdex_registry::{sync_plugins, PluginRecord, PluginSyncOutcome};

use super::RegistryArgs;

/// Arguments for the sync command.
#[derive(Args)]
pub struct SyncArgs {
    /// Plugin identifiers such as `ghcr.io/acme/linter`
    #[arg(required = true)]
    pub plugins: Vec<String>,

    /// Print the synced records as a JSON array on stdout
    #[arg(long)]
    pub json: bool,
}

/// Runs the sync command.
///
/// # Errors
///
/// Returns an error if any plugin failed to sync.
pub async fn run(registry: &RegistryArgs, args: &SyncArgs) -> Result<()> {
    let client = registry.client()?;
    let options = registry.request_options();

    let outcomes = sync_plugins(&client, &args.plugins, &options).await;

    for outcome in &outcomes {
        eprintln!("{}", status_line(outcome));
    }

    if args.json {
        let records: Vec<&PluginRecord> = outcomes.iter().filter_map(PluginSyncOutcome::record).collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
    }

    let failed = outcomes.iter().filter(|o| !o.is_synced()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} plugins failed to sync", outcomes.len());
    }
    Ok(())
}

fn status_line(outcome: &PluginSyncOutcome) -> String {
    match outcome {
        PluginSyncOutcome::Synced {
            plugin,
            record,
            failures,
        } => {
            let latest = record.latest.as_deref().unwrap_or("-");
            if failures.is_empty() {
                format!("✓ {plugin}: {} version(s), latest {latest}", record.versions.len())
            } else {
                format!(
                    "✓ {plugin}: {} version(s), latest {latest}, {} tag(s) skipped",
                    record.versions.len(),
                    failures.len()
                )
            }
        }
        PluginSyncOutcome::Failed { plugin, error } => format!("✗ {plugin}: {error}"),
    }
}
