//! Tags command implementation.

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use plugdex_registry::sort_tags_by_priority;

use super::RegistryArgs;

/// Arguments for the tags command.
#[derive(Args)]
pub struct TagsArgs {
    /// Repository such as `ghcr.io/acme/linter`
    pub repository: String,

    /// Tags requested per page
    #[arg(long, default_value = "100")]
    pub page_size: u32,

    /// Stop after this many pages
    #[arg(long)]
    pub page_limit: Option<usize>,

    /// Print tags in priority order instead of registry order
    #[arg(long)]
    pub sorted: bool,
}

/// Runs the tags command.
///
/// Unsorted output is printed page by page as pages arrive.
///
/// # Errors
///
/// Returns an error if the repository is invalid or a page cannot be read.
/// Tags of pages read before the failure are still printed.
pub async fn run(registry: &RegistryArgs, args: &TagsArgs) -> Result<()> {
    let mut config = registry.config()?.with_page_size(args.page_size);
    if let Some(limit) = args.page_limit {
        config = config.with_page_limit(limit);
    }
    let client = plugdex_registry::ManifestClient::new(config)?;
    let repo = client.parse_repo(&args.repository)?;
    let options = registry.request_options();

    info!(repository = %repo, "Listing tags");

    let mut pager = client.list_tags(&repo, &options);
    if args.sorted {
        let tags = pager.collect_tags().await.context("Failed to list tags")?;
        for tag in sort_tags_by_priority(&tags) {
            println!("{tag}");
        }
        return Ok(());
    }

    loop {
        match pager.next_page().await {
            Ok(Some(tags)) => tags.iter().for_each(|tag| println!("{tag}")),
            Ok(None) => break,
            Err(err) => {
                err.partial_tags().iter().for_each(|tag| println!("{tag}"));
                return Err(err).context("Failed to list tags");
            }
        }
    }

    info!(repository = %repo, pages = pager.pages_fetched(), "Listed tags");
    Ok(())
}
