//! Version reconciliation.
//!
//! A plugin release is often pushed under several tags (`1.2.3`, `1.2`,
//! `latest`) that all point at the same manifest. Reconciliation collapses
//! those tags into one [`GroupedVersion`] per digest and picks the tag that
//! best names the release:
//!
//! - tags starting with `MAJOR.MINOR.PATCH` rank above every other tag
//! - within a class, tags compare segment by segment, digit runs numerically
//! - higher versions come first (`10.0.0` before `2.0.0`)

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata of a single tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawVersion {
    /// The tag.
    pub tag: String,

    /// Verified manifest digest the tag resolves to.
    pub sha: String,

    /// Publication time from the manifest's `created` annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,

    /// Sum of the artifact's layer sizes in bytes.
    pub size: u64,

    /// Manifest annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// All tags sharing one manifest digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedVersion {
    /// Manifest digest, unique within one reconciliation result.
    pub sha: String,

    /// Highest-priority tag of the group.
    pub canonical_tag: String,

    /// Remaining tags in priority order; never contains `canonical_tag`.
    pub additional_tags: Vec<String>,

    /// Publication time of the first tag observed with this digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,

    /// Size of the first tag observed with this digest.
    pub size: u64,

    /// Annotations of the first tag observed with this digest.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl GroupedVersion {
    /// Iterates over every tag of the group, canonical tag first.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.canonical_tag.as_str()).chain(self.additional_tags.iter().map(String::as_str))
    }
}

/// Orders two tags by priority: [`Ordering::Less`] means `a` ranks higher
/// and sorts first.
///
/// # Examples
///
/// ```
/// use std::cmp::Ordering;
/// use plugdex_registry::compare_tag_priority;
///
/// assert_eq!(compare_tag_priority("10.0.0", "2.0.0"), Ordering::Less);
/// assert_eq!(compare_tag_priority("latest", "0.0.1"), Ordering::Greater);
/// ```
#[must_use]
pub fn compare_tag_priority(a: &str, b: &str) -> Ordering {
    match (has_semver_prefix(a), has_semver_prefix(b)) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => natural_cmp(b, a),
    }
}

/// Sorts tags from highest to lowest priority.
///
/// The sort is stable: tags that compare equal keep their input order.
///
/// # Examples
///
/// ```
/// use plugdex_registry::sort_tags_by_priority;
///
/// let sorted = sort_tags_by_priority(&["1.0.0", "2.0.0", "1.5.0"]);
/// assert_eq!(sorted, vec!["2.0.0", "1.5.0", "1.0.0"]);
/// ```
#[must_use]
pub fn sort_tags_by_priority<S: AsRef<str>>(tags: &[S]) -> Vec<String> {
    let mut sorted: Vec<String> = tags.iter().map(|t| t.as_ref().to_string()).collect();
    sorted.sort_by(|a, b| compare_tag_priority(a, b));
    sorted
}

/// Collapses tags that resolve to the same digest.
///
/// Metadata of a group comes from the first entry observed with its digest.
/// Groups are ordered by canonical tag, highest priority first.
#[must_use]
pub fn group_versions_by_sha(raw_versions: &[RawVersion]) -> Vec<GroupedVersion> {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, (&RawVersion, Vec<&str>)> = HashMap::new();

    for raw in raw_versions {
        match groups.get_mut(raw.sha.as_str()) {
            Some((first, tags)) => {
                if first.size != raw.size
                    || first.published_at != raw.published_at
                    || first.annotations != raw.annotations
                {
                    tracing::debug!(
                        digest = %raw.sha,
                        kept = %first.tag,
                        ignored = %raw.tag,
                        "tags sharing a digest report different metadata"
                    );
                }
                tags.push(raw.tag.as_str());
            }
            None => {
                order.push(raw.sha.as_str());
                groups.insert(raw.sha.as_str(), (raw, vec![raw.tag.as_str()]));
            }
        }
    }

    let mut grouped: Vec<GroupedVersion> = order
        .into_iter()
        .filter_map(|sha| groups.remove(sha))
        .map(|(first, tags)| {
            let mut tags = sort_tags_by_priority(&tags).into_iter();
            let canonical_tag = tags.next().unwrap_or_default();
            GroupedVersion {
                sha: first.sha.clone(),
                canonical_tag,
                additional_tags: tags.collect(),
                published_at: first.published_at,
                size: first.size,
                annotations: first.annotations.clone(),
            }
        })
        .collect();

    grouped.sort_by(|a, b| compare_tag_priority(&a.canonical_tag, &b.canonical_tag));
    grouped
}

/// Returns true if `tag` starts with `digits.digits.digits`.
pub(crate) fn has_semver_prefix(tag: &str) -> bool {
    let mut rest = tag;
    for component in 0..3 {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return false;
        }
        rest = &rest[digits..];
        if component < 2 {
            match rest.strip_prefix('.') {
                Some(after) => rest = after,
                None => return false,
            }
        }
    }
    true
}

/// Ascending comparison where runs of ASCII digits compare as numbers.
fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = Segments(a);
    let mut right = Segments(b);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = if is_digit_run(x) && is_digit_run(y) {
                    numeric_cmp(x, y)
                } else {
                    x.cmp(y)
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Compares digit strings of any length without overflowing.
fn numeric_cmp(x: &str, y: &str) -> Ordering {
    let x = x.trim_start_matches('0');
    let y = y.trim_start_matches('0');
    x.len().cmp(&y.len()).then_with(|| x.cmp(y))
}

fn is_digit_run(segment: &str) -> bool {
    segment.bytes().next().is_some_and(|b| b.is_ascii_digit())
}

/// Splits a string into alternating digit and non-digit runs.
struct Segments<'a>(&'a str);

impl<'a> Iterator for Segments<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let first = self.0.bytes().next()?;
        let digit = first.is_ascii_digit();
        let len = self
            .0
            .bytes()
            .take_while(|b| b.is_ascii_digit() == digit)
            .count();
        let (segment, rest) = self.0.split_at(len);
        self.0 = rest;
        Some(segment)
    }
}
