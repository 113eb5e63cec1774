//! # Plugdex Registry
//!
//! OCI registry client and version reconciliation for the plugdex plugin
//! marketplace.
//!
//! Each plugin release is published as a tagged OCI artifact. This crate
//! reads those releases back: it parses registry identifiers, negotiates
//! registry authentication, pages through tag lists, fetches and verifies
//! manifests, and collapses tags that point at the same content into one
//! version record.
//!
//! ## Features
//!
//! - **Reference parsing**: Docker-style `index/namespace/name:tag@digest`
//!   identifiers, including the official `docker.io` index
//! - **Challenge auth**: Basic and Bearer `WWW-Authenticate` negotiation with
//!   a shared, single-flight token cache
//! - **Verified manifests**: SHA-256 digest checks against
//!   `Docker-Content-Digest` and digest references
//! - **Lazy pagination**: `Link` header tag pages that can be stopped and
//!   restarted
//! - **Version reconciliation**: deterministic canonical tags per digest
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use plugdex_registry::{fetch_versions, ManifestClient, RegistryConfig, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ManifestClient::new(RegistryConfig::new())?;
//!     let repo = client.parse_repo("ghcr.io/acme/linter")?;
//!
//!     let report = fetch_versions(&client, &repo, &RequestOptions::new()).await?;
//!     for version in &report.versions {
//!         println!("{} {}", version.canonical_tag, version.sha);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            sync (fetch_versions, sync_plugins)              │
//! │  ┌─────────────────────────────┐  ┌──────────────────────┐  │
//! │  │      ManifestClient         │  │       version        │  │
//! │  │  (TagPager, manifests)      │  │  (sort, group)       │  │
//! │  └─────────────────────────────┘  └──────────────────────┘  │
//! │  ┌─────────────┐  ┌─────────────┐                           │
//! │  │AuthNegotiator│ │  Transport  │                           │
//! │  └─────────────┘  └─────────────┘                           │
//! └─────────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  OCI Registry                               │
//! │     (Docker Hub, GHCR, Harbor, distribution, etc.)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod auth;
mod client;
mod config;
mod error;
mod oci;
mod pagination;
mod reference;
mod sync;
mod transport;
mod version;


pub use auth::{AuthNegotiator, AuthScheme, AuthState, Challenge, TokenKey};
pub use client::{FetchedManifest, ManifestClient};
pub use config::{AuthInfo, RegistryConfig, RequestOptions, RetryPolicy};
pub use error::{ErrorKind, RegistryError, Result};
pub use oci::{
    compute_digest, is_valid_digest, Descriptor, ErrorResponse, ImageIndex, ImageManifest, Manifest,
    MediaType, Platform, RegistryApiError, TagList, ANNOTATION_CREATED, ANNOTATION_DESCRIPTION,
    ANNOTATION_TITLE, ANNOTATION_VERSION,
};
pub use pagination::{parse_next_link, resolve_link, TagPager};
pub use reference::{
    is_valid_tag, normalize, parse_index, parse_repo, parse_repo_and_ref, RegistryImage,
    RegistryIndex, RegistryRepo, Scheme, DEFAULT_INDEX_API_HOST, DEFAULT_INDEX_NAME, DEFAULT_TAG,
};
pub use sync::{
    fetch_versions, sync_plugins, with_retry, PluginRecord, PluginSyncOutcome, TagFailure,
    VersionFetchReport,
};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
pub use version::{
    compare_tag_priority, group_versions_by_sha, sort_tags_by_priority, GroupedVersion, RawVersion,
};
