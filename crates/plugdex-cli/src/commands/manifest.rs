//! Manifest command implementation.
//!
//! Fetches a manifest, verifies its digest and prints a summary.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use plugdex_registry::{FetchedManifest, RegistryImage};

use super::RegistryArgs;

/// Arguments for the manifest command.
#[derive(Args)]
pub struct ManifestArgs {
    /// Image reference such as `ghcr.io/acme/linter:1.0.0`
    pub reference: String,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Output format for the manifest command.
#[derive(Clone, Debug, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestSummary {
    reference: String,
    digest: String,
    media_type: Option<String>,
    is_index: bool,
    size: u64,
    annotations: BTreeMap<String, String>,
}

impl ManifestSummary {
    fn new(image: &RegistryImage, fetched: &FetchedManifest) -> Self {
        let manifest = &fetched.manifest;
        Self {
            reference: image.canonical_ref(),
            digest: fetched.digest.clone(),
            media_type: manifest.media_type().map(ToString::to_string),
            is_index: manifest.is_index(),
            size: manifest.layers_size(),
            annotations: manifest.annotations().cloned().unwrap_or_default(),
        }
    }
}

/// Runs the manifest command.
///
/// # Errors
///
/// Returns an error if the reference is invalid, the manifest cannot be
/// fetched or its digest does not match.
pub async fn run(registry: &RegistryArgs, args: &ManifestArgs) -> Result<()> {
    let client = registry.client()?;
    let image = client.parse_image(&args.reference)?;
    let options = registry.request_options();

    let fetched = client
        .get_image_manifest(&image, &options)
        .await
        .context("Failed to fetch manifest")?;
    let summary = ManifestSummary::new(&image, &fetched);

    match args.format {
        OutputFormat::Text => print_text(&summary),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
    }

    Ok(())
}

fn print_text(summary: &ManifestSummary) {
    println!("Reference:  {}", summary.reference);
    println!("Digest:     {}", summary.digest);
    println!(
        "Media type: {}",
        summary.media_type.as_deref().unwrap_or("(undeclared)")
    );
    if summary.is_index {
        println!("Kind:       index");
    } else {
        println!("Size:       {} bytes", summary.size);
    }
    for (key, value) in &summary.annotations {
        println!("  {key} = {value}");
    }
}
