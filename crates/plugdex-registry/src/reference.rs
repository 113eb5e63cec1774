//! Registry identifier parsing.
//!
//! Turns strings such as `ghcr.io/owner/plugin:1.2.0`,
//! `localhost:5000/plugin@sha256:...` or `alpine` into structured
//! [`RegistryIndex`], [`RegistryRepo`] and [`RegistryImage`] values.
//!
//! Parsing is pure: the same input always yields the same value and nothing
//! touches the network.

use std::str::FromStr;

use serde::Serialize;

use crate::error::{RegistryError, Result};
use crate::oci::is_valid_digest;

/// Name of the official index.
pub const DEFAULT_INDEX_NAME: &str = "docker.io";

/// Host serving the registry API of the official index.
pub const DEFAULT_INDEX_API_HOST: &str = "registry-1.docker.io";

/// Tag resolved when a reference carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

const OFFICIAL_NAMESPACE: &str = "library";

/// URL scheme of a registry index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Plaintext HTTP.
    Http,
    /// HTTP over TLS.
    Https,
}

impl Scheme {
    /// Returns the scheme string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// A registry host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryIndex {
    /// Bare `host[:port]`, never including a scheme.
    pub name: String,

    /// Scheme given explicitly in the identifier, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<Scheme>,

    /// Whether this is the official `docker.io` index.
    pub official: bool,
}

impl RegistryIndex {
    /// Returns the official index.
    #[must_use]
    pub fn official() -> Self {
        Self {
            name: DEFAULT_INDEX_NAME.to_string(),
            scheme: None,
            official: true,
        }
    }

    /// Parses an index string: `host`, `host:port` or `scheme://host[:port]`.
    ///
    /// # Errors
    ///
    /// Returns a format error for unsupported schemes, empty hosts, strings
    /// that do not look like a host, or a trailing repository path.
    ///
    /// # Examples
    ///
    /// ```
    /// use plugdex_registry::RegistryIndex;
    ///
    /// let index = RegistryIndex::parse("https://ghcr.io/").unwrap();
    /// assert_eq!(index.name, "ghcr.io");
    /// assert!(!index.official);
    /// ```
    pub fn parse(arg: &str) -> Result<Self> {
        if arg.is_empty() {
            return Ok(Self::official());
        }

        let (scheme, host) = match arg.split_once("://") {
            Some(("http", rest)) => (Some(Scheme::Http), rest),
            Some(("https", rest)) => (Some(Scheme::Https), rest),
            Some(_) => {
                return Err(RegistryError::invalid_reference(
                    arg,
                    "index scheme must be \"http\" or \"https\"",
                ))
            }
            None => (None, arg),
        };

        let host = host.strip_suffix('/').unwrap_or(host);
        if host.is_empty() {
            return Err(RegistryError::invalid_reference(arg, "index has an empty host"));
        }
        if host.contains('/') {
            return Err(RegistryError::invalid_reference(
                arg,
                "index must not include a repository path",
            ));
        }
        if !looks_like_host(host) {
            return Err(RegistryError::invalid_reference(
                arg,
                "index does not look like a host",
            ));
        }

        let name = if host == "index.docker.io" {
            DEFAULT_INDEX_NAME
        } else {
            host
        };
        let official = name == DEFAULT_INDEX_NAME;
        if official && scheme == Some(Scheme::Http) {
            return Err(RegistryError::invalid_reference(
                arg,
                "plaintext HTTP to the official index is not allowed",
            ));
        }

        Ok(Self {
            name: name.to_string(),
            scheme,
            official,
        })
    }

    /// Returns the base URL of the registry API, e.g. `https://ghcr.io`.
    ///
    /// Without an explicit scheme, loopback hosts use `http` and everything
    /// else uses `https`.
    #[must_use]
    pub fn base_url(&self) -> String {
        let host = if self.official {
            DEFAULT_INDEX_API_HOST
        } else {
            self.name.as_str()
        };
        let scheme = self.scheme.unwrap_or_else(|| {
            if is_loopback(host) {
                Scheme::Http
            } else {
                Scheme::Https
            }
        });
        format!("{}://{host}", scheme.as_str())
    }
}

impl std::fmt::Display for RegistryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// A repository (namespace) within an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryRepo {
    /// Index hosting the repository.
    pub index: RegistryIndex,

    /// Repository name as used in `/v2/<name>/...` paths.
    pub remote_name: String,

    /// Short name as shown to users (`alpine` for `library/alpine`).
    pub local_name: String,

    /// Index-qualified name; the index segment is omitted for the official index.
    pub canonical_name: String,
}

impl RegistryRepo {
    /// Token scope for pulling from this repository.
    #[must_use]
    pub fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.remote_name)
    }
}

impl std::fmt::Display for RegistryRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_name)
    }
}

impl FromStr for RegistryRepo {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        parse_repo(s, None)
    }
}

/// A repository plus an optional tag and digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryImage {
    /// The repository.
    #[serde(flatten)]
    pub repo: RegistryRepo,

    /// Tag, if one was given.
    pub tag: Option<String>,

    /// Digest, if one was given.
    pub digest: Option<String>,
}

impl RegistryImage {
    /// Returns `canonical_name[:tag][@digest]`.
    #[must_use]
    pub fn canonical_ref(&self) -> String {
        let mut out = self.repo.canonical_name.clone();
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        }
        out
    }

    /// Returns the manifest reference to resolve: the digest when present,
    /// else the tag, else `latest`.
    #[must_use]
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }
}

impl std::fmt::Display for RegistryImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_ref())
    }
}

impl FromStr for RegistryImage {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        parse_repo_and_ref(s, None)
    }
}

/// Normalizes a user-supplied registry identifier.
///
/// Trims surrounding whitespace and trailing slashes.
///
/// # Errors
///
/// Returns a format error when the result has no `/` or contains `//`
/// (a leading `http://` or `https://` is allowed).
///
/// # Examples
///
/// ```
/// use plugdex_registry::normalize;
///
/// assert_eq!(normalize("  ghcr.io/owner/repo/  ").unwrap(), "ghcr.io/owner/repo");
/// assert!(normalize("ghcr.io").is_err());
/// assert!(normalize("ghcr.io//o/r").is_err());
/// ```
pub fn normalize(raw: &str) -> Result<String> {
    let trimmed = raw
        .trim_start()
        .trim_end_matches(|c: char| c == '/' || c.is_whitespace());

    if !trimmed.contains('/') {
        return Err(RegistryError::invalid_reference(
            raw,
            "identifier must contain at least one '/'",
        ));
    }

    let path = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    if path.contains("//") {
        return Err(RegistryError::invalid_reference(
            raw,
            "identifier must not contain consecutive slashes",
        ));
    }

    Ok(trimmed.to_string())
}

/// Parses the optional index string, defaulting to the official index.
///
/// # Errors
///
/// See [`RegistryIndex::parse`].
pub fn parse_index(arg: Option<&str>) -> Result<RegistryIndex> {
    arg.map_or_else(|| Ok(RegistryIndex::official()), RegistryIndex::parse)
}

/// Parses a repository identifier with an optional leading `INDEX/` segment.
///
/// The first segment is taken as the index when it carries a scheme, or
/// contains `.` or `:`, or is `localhost`; otherwise `default_index` (or the
/// official index) applies.
///
/// # Errors
///
/// Returns a format error for malformed index or repository names.
///
/// # Examples
///
/// ```
/// use plugdex_registry::parse_repo;
///
/// let repo = parse_repo("ghcr.io/owner/plugin", None).unwrap();
/// assert_eq!(repo.index.name, "ghcr.io");
/// assert_eq!(repo.remote_name, "owner/plugin");
/// assert_eq!(repo.canonical_name, "ghcr.io/owner/plugin");
///
/// let repo = parse_repo("alpine", None).unwrap();
/// assert_eq!(repo.remote_name, "library/alpine");
/// assert_eq!(repo.local_name, "alpine");
/// ```
pub fn parse_repo(arg: &str, default_index: Option<&RegistryIndex>) -> Result<RegistryRepo> {
    let (index, remote) = if let Some(scheme_end) = arg.find("://") {
        let slash = arg[scheme_end + 3..]
            .find('/')
            .map(|i| i + scheme_end + 3)
            .ok_or_else(|| RegistryError::invalid_reference(arg, "missing repository name"))?;
        (RegistryIndex::parse(&arg[..slash])?, &arg[slash + 1..])
    } else {
        match arg.split_once('/') {
            Some((first, rest)) if looks_like_host(first) => (RegistryIndex::parse(first)?, rest),
            _ => (
                default_index.cloned().unwrap_or_else(RegistryIndex::official),
                arg,
            ),
        }
    };

    let (namespace, name) = match remote.split_once('/') {
        Some((ns, name)) => {
            validate_namespace(arg, ns)?;
            (Some(ns), name)
        }
        None if index.official => (Some(OFFICIAL_NAMESPACE), remote),
        None => (None, remote),
    };
    validate_name(arg, name)?;

    let remote_name = match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    };

    let (local_name, canonical_name) = if index.official {
        let local = if namespace == Some(OFFICIAL_NAMESPACE) {
            name.to_string()
        } else {
            remote_name.clone()
        };
        (local, remote_name.clone())
    } else {
        let qualified = format!("{}/{remote_name}", index.name);
        (qualified.clone(), qualified)
    };

    Ok(RegistryRepo {
        index,
        remote_name,
        local_name,
        canonical_name,
    })
}

/// Parses a repository identifier with an optional `:tag`, `@digest`, or
/// `:tag@digest` suffix.
///
/// # Errors
///
/// Returns a format error for malformed digests or tags, and everything
/// [`parse_repo`] rejects.
///
/// # Examples
///
/// ```
/// use plugdex_registry::parse_repo_and_ref;
///
/// let image = parse_repo_and_ref("ghcr.io/owner/repo:v1.0.0", None).unwrap();
/// assert_eq!(image.repo.canonical_name, "ghcr.io/owner/repo");
/// assert_eq!(image.tag.as_deref(), Some("v1.0.0"));
/// assert_eq!(image.digest, None);
/// ```
pub fn parse_repo_and_ref(arg: &str, default_index: Option<&RegistryIndex>) -> Result<RegistryImage> {
    let (rest, digest) = match arg.rsplit_once('@') {
        Some((rest, digest)) => {
            if !is_valid_digest(digest) {
                return Err(RegistryError::invalid_reference(
                    arg,
                    "digest must have the form algorithm:hex",
                ));
            }
            (rest, Some(digest.to_string()))
        }
        None => (arg, None),
    };

    let slash = rest.rfind('/');
    let (rest, tag) = match rest.rfind(':') {
        Some(colon) if slash.map_or(true, |s| colon > s) => {
            let tag = &rest[colon + 1..];
            if !is_valid_tag(tag) {
                return Err(RegistryError::invalid_reference(arg, "invalid tag"));
            }
            (&rest[..colon], Some(tag.to_string()))
        }
        _ => (rest, None),
    };

    let repo = parse_repo(rest, default_index)?;
    Ok(RegistryImage { repo, tag, digest })
}

/// Returns true if `tag` matches `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
#[must_use]
pub fn is_valid_tag(tag: &str) -> bool {
    let mut bytes = tag.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    tag.len() <= 128
        && (first.is_ascii_alphanumeric() || first == b'_')
        && bytes.all(|b| b.is_ascii_alphanumeric() || b"._-".contains(&b))
}

fn looks_like_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

fn is_loopback(host: &str) -> bool {
    let bare = host.rsplit_once(':').map_or(host, |(h, _)| h);
    bare == "localhost" || bare.starts_with("127.") || bare == "[::1]"
}

fn validate_namespace(input: &str, ns: &str) -> Result<()> {
    if !(2..=255).contains(&ns.len()) {
        return Err(RegistryError::invalid_reference(
            input,
            "repository namespace must be between 2 and 255 characters",
        ));
    }
    if !ns
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"._-".contains(&b))
    {
        return Err(RegistryError::invalid_reference(
            input,
            "repository namespace may only contain [a-z0-9._-]",
        ));
    }
    if ns.starts_with('-') || ns.ends_with('-') || ns.contains("--") {
        return Err(RegistryError::invalid_reference(
            input,
            "repository namespace has misplaced hyphens",
        ));
    }
    Ok(())
}

fn validate_name(input: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.split('/').any(str::is_empty) {
        return Err(RegistryError::invalid_reference(
            input,
            "repository name has an empty path segment",
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"_/.-".contains(&b))
    {
        return Err(RegistryError::invalid_reference(
            input,
            "repository name may only contain [a-z0-9_/.-]",
        ));
    }
    Ok(())
}
