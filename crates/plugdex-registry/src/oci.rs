//! OCI Distribution Specification types.
//!
//! This module defines the manifest, index and descriptor documents served by
//! `GET /v2/<name>/manifests/<reference>`, the tag list body, and the registry
//! error envelope.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{RegistryError, Result};

/// Annotation carrying the artifact creation time (RFC 3339).
pub const ANNOTATION_CREATED: &str = "org.opencontainers.image.created";

/// Annotation carrying the artifact version.
pub const ANNOTATION_VERSION: &str = "org.opencontainers.image.version";

/// Annotation carrying the artifact title.
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";

/// Annotation carrying the artifact description.
pub const ANNOTATION_DESCRIPTION: &str = "org.opencontainers.image.description";

/// Manifest and index media types understood by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaType(String);

impl MediaType {
    /// OCI image manifest media type.
    pub const OCI_MANIFEST: &'static str = "application/vnd.oci.image.manifest.v1+json";

    /// OCI image index media type.
    pub const OCI_INDEX: &'static str = "application/vnd.oci.image.index.v1+json";

    /// Docker image manifest (schema 2) media type.
    pub const DOCKER_MANIFEST: &'static str = "application/vnd.docker.distribution.manifest.v2+json";

    /// Docker manifest list media type.
    pub const DOCKER_MANIFEST_LIST: &'static str =
        "application/vnd.docker.distribution.manifest.list.v2+json";

    /// Docker schema 1 manifest media type.
    pub const DOCKER_MANIFEST_V1: &'static str = "application/vnd.docker.distribution.manifest.v1+json";

    /// Docker signed schema 1 manifest media type.
    pub const DOCKER_MANIFEST_V1_SIGNED: &'static str =
        "application/vnd.docker.distribution.manifest.v1+prettyjws";

    /// Media types sent in the `Accept` header of manifest requests.
    pub const ACCEPTED: [&'static str; 4] = [
        Self::OCI_MANIFEST,
        Self::DOCKER_MANIFEST,
        Self::OCI_INDEX,
        Self::DOCKER_MANIFEST_LIST,
    ];

    /// Creates a new media type, dropping any parameters (`; charset=...`).
    #[must_use]
    pub fn new(media_type: impl Into<String>) -> Self {
        let media_type = media_type.into();
        match media_type.split_once(';') {
            Some((essence, _)) => Self(essence.trim().to_string()),
            None => Self(media_type.trim().to_string()),
        }
    }

    /// Returns the media type string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the value of the `Accept` header for manifest requests.
    #[must_use]
    pub fn accept_header() -> String {
        Self::ACCEPTED.join(", ")
    }

    /// Returns true for single-artifact manifest media types.
    #[must_use]
    pub fn is_image_manifest(&self) -> bool {
        self.0 == Self::OCI_MANIFEST || self.0 == Self::DOCKER_MANIFEST
    }

    /// Returns true for manifest list / image index media types.
    #[must_use]
    pub fn is_index(&self) -> bool {
        self.0 == Self::OCI_INDEX || self.0 == Self::DOCKER_MANIFEST_LIST
    }

    /// Returns true for the legacy schema 1 media types.
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        self.0 == Self::DOCKER_MANIFEST_V1 || self.0 == Self::DOCKER_MANIFEST_V1_SIGNED
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MediaType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Serialize for MediaType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(s))
    }
}

/// Computes the `sha256:<hex>` digest of data.
///
/// # Examples
///
/// ```
/// use plugdex_registry::compute_digest;
///
/// assert_eq!(
///     compute_digest(b""),
///     "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
/// );
/// ```
#[must_use]
pub fn compute_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Returns true if `digest` has the `algorithm:hex` shape.
///
/// The algorithm is `[a-z0-9+._-]+` and the encoded part is lowercase hex.
#[must_use]
pub fn is_valid_digest(digest: &str) -> bool {
    let Some((algorithm, encoded)) = digest.split_once(':') else {
        return false;
    };
    !algorithm.is_empty()
        && algorithm
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"+._-".contains(&b))
        && !encoded.is_empty()
        && encoded
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Platform of an index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture.
    pub architecture: String,

    /// Operating system.
    pub os: String,

    /// Optional CPU variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// OCI content descriptor.
///
/// A descriptor describes the disposition of targeted content. It includes
/// the type of the content, a content identifier (digest), and the byte-size
/// of the raw content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: MediaType,

    /// Digest of the targeted content.
    pub digest: String,

    /// Size in bytes of the content.
    pub size: u64,

    /// Optional URLs for alternative locations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,

    /// Optional annotations (key-value metadata).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Platform, for index entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    /// Creates a new descriptor.
    ///
    /// # Examples
    ///
    /// ```
    /// use plugdex_registry::{Descriptor, MediaType};
    ///
    /// let desc = Descriptor::new(
    ///     MediaType::new("application/vnd.oci.image.layer.v1.tar+gzip"),
    ///     "sha256:abc123",
    ///     1024,
    /// );
    /// assert_eq!(desc.digest_algorithm(), "sha256");
    /// ```
    #[must_use]
    pub fn new(media_type: MediaType, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type,
            digest: digest.into(),
            size,
            urls: None,
            annotations: None,
            platform: None,
        }
    }

    /// Adds an annotation to the descriptor.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Returns the digest algorithm (e.g., "sha256").
    #[must_use]
    pub fn digest_algorithm(&self) -> &str {
        self.digest.split(':').next().unwrap_or("sha256")
    }

    /// Returns the digest value (without algorithm prefix).
    #[must_use]
    pub fn digest_value(&self) -> &str {
        self.digest.split(':').nth(1).unwrap_or(&self.digest)
    }

    fn validate(&self) -> Result<()> {
        if is_valid_digest(&self.digest) {
            Ok(())
        } else {
            Err(RegistryError::protocol(format!(
                "descriptor has malformed digest '{}'",
                self.digest
            )))
        }
    }
}

/// OCI Image Manifest.
///
/// This structure describes a single container image or artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version (always 2).
    pub schema_version: u32,

    /// Media type of this manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,

    /// Configuration descriptor (optional for artifacts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,

    /// Layers that make up the artifact.
    #[serde(default)]
    pub layers: Vec<Descriptor>,

    /// Optional annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Optional artifact type (OCI 1.1+).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// Optional subject descriptor for referrers API (OCI 1.1+).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
}

impl ImageManifest {
    /// Creates a new OCI manifest with the given layers.
    #[must_use]
    pub fn new(layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MediaType::new(MediaType::OCI_MANIFEST)),
            config: None,
            layers,
            annotations: None,
            artifact_type: None,
            subject: None,
        }
    }

    /// Adds an annotation to the manifest.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Total size of all layers. The config blob is not counted.
    #[must_use]
    pub fn layers_size(&self) -> u64 {
        self.layers
            .iter()
            .fold(0u64, |total, layer| total.saturating_add(layer.size))
    }
}

/// OCI Image Index (or Docker manifest list).
///
/// Entries are parsed but never resolved recursively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Schema version (always 2).
    pub schema_version: u32,

    /// Media type of this index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,

    /// Entries of the index.
    #[serde(default)]
    pub manifests: Vec<Descriptor>,

    /// Optional annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Optional artifact type (OCI 1.1+).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

/// A manifest document classified by its media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    /// A single artifact manifest.
    Image(ImageManifest),
    /// A manifest list / image index.
    Index(ImageIndex),
}

impl Manifest {
    /// Parses and classifies a manifest body.
    ///
    /// `content_type` is the response `Content-Type`, used when the body does
    /// not declare its own `mediaType`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnsupportedManifest`] for schema 1 payloads and
    /// unknown media types, and a protocol error for malformed JSON.
    pub fn from_slice(body: &[u8], content_type: Option<&str>) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(body)?;
        let object = value
            .as_object()
            .ok_or_else(|| RegistryError::protocol("manifest body is not a JSON object"))?;

        let declared = object
            .get("mediaType")
            .and_then(serde_json::Value::as_str)
            .map(MediaType::new)
            .or_else(|| content_type.map(MediaType::new));

        match object.get("schemaVersion").and_then(serde_json::Value::as_u64) {
            Some(2) => {}
            Some(1) => {
                return Err(RegistryError::UnsupportedManifest {
                    media_type: declared.map(|m| m.to_string()),
                    message: "schema version 1 manifests are not supported".to_string(),
                })
            }
            Some(other) => {
                return Err(RegistryError::UnsupportedManifest {
                    media_type: declared.map(|m| m.to_string()),
                    message: format!("unknown schema version {other}"),
                })
            }
            None => return Err(RegistryError::protocol("manifest has no schemaVersion")),
        }

        // Registries commonly answer with application/json or octet-stream;
        // treat those like an undeclared media type.
        let declared = declared.filter(|m| {
            m.is_image_manifest() || m.is_index() || m.is_legacy() || m.as_str().starts_with("application/vnd.")
        });

        let manifest = match declared {
            Some(m) if m.is_index() => Self::Index(serde_json::from_value(value)?),
            Some(m) if m.is_image_manifest() => Self::Image(serde_json::from_value(value)?),
            Some(m) => {
                return Err(RegistryError::UnsupportedManifest {
                    message: format!("unsupported media type '{m}'"),
                    media_type: Some(m.to_string()),
                })
            }
            None if object.contains_key("manifests") => Self::Index(serde_json::from_value(value)?),
            None if object.contains_key("layers") || object.contains_key("config") => {
                Self::Image(serde_json::from_value(value)?)
            }
            None => {
                return Err(RegistryError::protocol(
                    "cannot classify manifest without mediaType, layers or manifests",
                ))
            }
        };

        manifest.validate()?;
        Ok(manifest)
    }

    /// Returns the media type declared by the document, if any.
    #[must_use]
    pub const fn media_type(&self) -> Option<&MediaType> {
        match self {
            Self::Image(m) => m.media_type.as_ref(),
            Self::Index(i) => i.media_type.as_ref(),
        }
    }

    /// Returns true for manifest lists / image indexes.
    #[must_use]
    pub const fn is_index(&self) -> bool {
        matches!(self, Self::Index(_))
    }

    /// Returns the document annotations, if any.
    #[must_use]
    pub const fn annotations(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::Image(m) => m.annotations.as_ref(),
            Self::Index(i) => i.annotations.as_ref(),
        }
    }

    /// Total size of the artifact's layers; zero for an index.
    #[must_use]
    pub fn layers_size(&self) -> u64 {
        match self {
            Self::Image(m) => m.layers_size(),
            Self::Index(_) => 0,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Image(m) => m
                .config
                .iter()
                .chain(&m.layers)
                .chain(&m.subject)
                .try_for_each(Descriptor::validate),
            Self::Index(i) => i.manifests.iter().try_for_each(Descriptor::validate),
        }
    }
}

/// Response from the `/v2/<name>/tags/list` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagList {
    /// Repository name.
    #[serde(default)]
    pub name: String,

    /// List of tags. Some registries send `null` for an empty repository.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tags: Vec<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Error response from registry API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// List of errors.
    #[serde(default)]
    pub errors: Vec<RegistryApiError>,
}

impl ErrorResponse {
    /// Parses the error envelope of a failed response, tolerating bodies that
    /// are not JSON.
    #[must_use]
    pub fn parse(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }
}

/// Individual error from registry API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryApiError {
    /// Error code.
    pub code: String,

    /// Human-readable message.
    #[serde(default)]
    pub message: String,

    /// Additional details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}
