//! Plugdex CLI - inspect plugin releases published to OCI registries.

use std::process::ExitCode;

use clap::Parser;
use plugdex_registry::RegistryError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so command output stays pipeable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plugdex=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Parse(args) => commands::parse::run(&cli.registry, &args),
        Commands::Tags(args) => commands::tags::run(&cli.registry, &args).await,
        Commands::Manifest(args) => commands::manifest::run(&cli.registry, &args).await,
        Commands::Versions(args) => commands::versions::run(&cli.registry, &args).await,
        Commands::Sync(args) => commands::sync::run(&cli.registry, &args).await,
        Commands::Version => {
            println!("plugdex {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Maps registry failures to their documented exit codes; anything else is 1.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<RegistryError>()
        .map_or(1, |e| u8::try_from(e.exit_code()).unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_of_registry_errors() {
        let err = anyhow::Error::new(RegistryError::NotFound {
            what: "manifest acme/linter:1.0.0".to_string(),
            errors: Vec::new(),
        })
        .context("failed to fetch manifest");
        assert_eq!(exit_code(&err), 4);

        let err = anyhow::Error::new(RegistryError::Cancelled {
            operation: "list tags".to_string(),
        });
        assert_eq!(exit_code(&err), 130);
    }

    #[test]
    fn test_exit_code_of_other_errors() {
        assert_eq!(exit_code(&anyhow::anyhow!("2 of 3 plugins failed")), 1);
    }
}
