//! Parse command implementation.
//!
//! Parses a registry identifier offline and prints the result as JSON.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use plugdex_registry::RegistryImage;

use super::RegistryArgs;

/// Arguments for the parse command.
#[derive(Args)]
pub struct ParseArgs {
    /// Identifier such as `ghcr.io/acme/linter:1.0.0`
    pub reference: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ParsedReference<'a> {
    #[serde(flatten)]
    image: &'a RegistryImage,
    canonical_ref: String,
    resolves_to: &'a str,
    pull_scope: String,
}

impl<'a> ParsedReference<'a> {
    fn new(image: &'a RegistryImage) -> Self {
        Self {
            image,
            canonical_ref: image.canonical_ref(),
            resolves_to: image.reference(),
            pull_scope: image.repo.pull_scope(),
        }
    }
}

/// Runs the parse command.
///
/// # Errors
///
/// Returns an error if the identifier is malformed.
pub fn run(registry: &RegistryArgs, args: &ParseArgs) -> Result<()> {
    let config = registry.config()?;
    let image = plugdex_registry::parse_repo_and_ref(&args.reference, config.default_index.as_ref())?;

    println!("{}", serde_json::to_string_pretty(&ParsedReference::new(&image))?);
    Ok(())
}
