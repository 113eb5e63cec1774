//! CLI commands and argument parsing.

pub mod manifest;
pub mod parse;
pub mod sync;
pub mod tags;
pub mod versions;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use plugdex_registry::{AuthInfo, ManifestClient, RegistryConfig, RegistryIndex, RequestOptions};

/// Plugdex - plugin releases from OCI registries
#[derive(Parser)]
#[command(name = "plugdex")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub registry: RegistryArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Parse a registry identifier and print its parts
    Parse(parse::ParseArgs),

    /// List the tags of a repository
    Tags(tags::TagsArgs),

    /// Fetch and verify a manifest
    Manifest(manifest::ManifestArgs),

    /// Print the reconciled versions of a plugin
    Versions(versions::VersionsArgs),

    /// Sync a batch of plugins
    Sync(sync::SyncArgs),

    /// Print version information
    Version,
}

/// Registry connection options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct RegistryArgs {
    /// Username for basic authentication
    #[arg(short, long, global = true, env = "PLUGDEX_USERNAME")]
    pub username: Option<String>,

    /// Password for basic authentication
    #[arg(long, global = true, env = "PLUGDEX_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Bearer token for authentication
    #[arg(long, global = true, env = "PLUGDEX_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Index used for identifiers without one (defaults to docker.io)
    #[arg(long, global = true, env = "PLUGDEX_DEFAULT_INDEX")]
    pub index: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, global = true, default_value = "30")]
    pub timeout: u64,

    /// Overall deadline for the command in seconds
    #[arg(long, global = true)]
    pub deadline: Option<u64>,

    /// Maximum concurrent manifest requests
    #[arg(long, global = true, default_value = "8")]
    pub concurrency: usize,
}

impl RegistryArgs {
    /// Builds the client configuration from the arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials are incomplete or the index is invalid.
    pub fn config(&self) -> Result<RegistryConfig> {
        let mut config = RegistryConfig::new()
            .with_auth(determine_auth(self)?)
            .with_timeout(Duration::from_secs(self.timeout))
            .with_concurrency(self.concurrency);

        if let Some(ref index) = self.index {
            let index = RegistryIndex::parse(index).context("Invalid --index")?;
            config = config.with_default_index(index);
        }

        Ok(config)
    }

    /// Creates a registry client.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn client(&self) -> Result<ManifestClient> {
        Ok(ManifestClient::new(self.config()?)?)
    }

    /// Request options honoring `--deadline` and Ctrl-C.
    ///
    /// Must be called from within the runtime.
    pub fn request_options(&self) -> RequestOptions {
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling");
                on_interrupt.cancel();
            }
        });

        let options = RequestOptions::new().with_cancel(cancel);
        match self.deadline {
            Some(secs) => options.with_timeout(Duration::from_secs(secs)),
            None => options,
        }
    }
}

/// Determines the authentication method from CLI arguments.
fn determine_auth(args: &RegistryArgs) -> Result<AuthInfo> {
    if let Some(ref token) = args.token {
        return Ok(AuthInfo::bearer(token));
    }

    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        return Ok(AuthInfo::basic(username, password));
    }

    if args.username.is_some() || args.password.is_some() {
        anyhow::bail!("Both --username and --password are required for basic authentication");
    }

    // Anonymous; the registry may still hand out pull tokens.
    Ok(AuthInfo::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> RegistryArgs {
        RegistryArgs {
            username: None,
            password: None,
            token: None,
            index: None,
            timeout: 30,
            deadline: None,
            concurrency: 8,
        }
    }

    #[test]
    fn test_determine_auth_none() {
        assert_eq!(determine_auth(&args()).unwrap(), AuthInfo::None);
    }

    #[test]
    fn test_determine_auth_bearer_wins() {
        let args = RegistryArgs {
            token: Some("test-token".to_string()),
            username: Some("user".to_string()),
            ..args()
        };
        assert_eq!(determine_auth(&args).unwrap(), AuthInfo::bearer("test-token"));
    }

    #[test]
    fn test_determine_auth_basic() {
        let args = RegistryArgs {
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            ..args()
        };
        assert_eq!(determine_auth(&args).unwrap(), AuthInfo::basic("user", "pass"));
    }

    #[test]
    fn test_determine_auth_incomplete_basic() {
        let args = RegistryArgs {
            username: Some("user".to_string()),
            ..args()
        };
        assert!(determine_auth(&args).is_err());
    }

    #[test]
    fn test_config_from_args() {
        let args = RegistryArgs {
            index: Some("ghcr.io".to_string()),
            timeout: 5,
            concurrency: 3,
            ..args()
        };
        let config = args.config().unwrap();
        assert_eq!(config.default_index.unwrap().name, "ghcr.io");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.concurrency, 3);
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let args = RegistryArgs {
            concurrency: 0,
            ..args()
        };
        assert!(args.client().is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "plugdex",
            "tags",
            "ghcr.io/acme/linter",
            "--concurrency",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.registry.concurrency, 2);
        assert!(matches!(cli.command, Commands::Tags(_)));
    }
}
