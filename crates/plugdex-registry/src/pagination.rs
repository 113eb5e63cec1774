//! Tag list pagination.
//!
//! Registries split large tag lists into pages and point at the next one with
//! an RFC 8288 `Link: <url>; rel="next"` header. [`TagPager`] walks those
//! pages lazily, one request per [`TagPager::next_page`] call.

use std::collections::HashSet;

use url::Url;

use crate::client::ManifestClient;
use crate::config::RequestOptions;
use crate::error::{RegistryError, Result};
use crate::oci::TagList;
use crate::reference::RegistryRepo;
use crate::transport::HttpResponse;

/// Extracts the `rel="next"` target from a `Link` header value.
///
/// Returns `Ok(None)` when the header links nowhere as `next`.
///
/// # Errors
///
/// Returns a protocol error when the header is not a list of
/// `<uri-reference>; param=value` entries.
///
/// # Examples
///
/// ```
/// use plugdex_registry::parse_next_link;
///
/// let next = parse_next_link(r#"</v2/owner/plugin/tags/list?n=2&last=b>; rel="next""#).unwrap();
/// assert_eq!(next.as_deref(), Some("/v2/owner/plugin/tags/list?n=2&last=b"));
/// ```
pub fn parse_next_link(header: &str) -> Result<Option<String>> {
    let malformed = || RegistryError::protocol(format!("malformed Link header: {header}"));

    let mut rest = header.trim();
    while !rest.is_empty() {
        let inner = rest.strip_prefix('<').ok_or_else(malformed)?;
        let (target, after) = inner.split_once('>').ok_or_else(malformed)?;
        let (params, remaining) = after.split_once(',').unwrap_or((after, ""));

        let params = params.trim();
        if !params.is_empty() && !params.starts_with(';') {
            return Err(malformed());
        }

        let is_next = params
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .filter_map(|p| p.split_once('='))
            .any(|(key, value)| {
                key.trim().eq_ignore_ascii_case("rel")
                    && value
                        .trim()
                        .trim_matches('"')
                        .split_whitespace()
                        .any(|rel| rel.eq_ignore_ascii_case("next"))
            });

        if is_next {
            let target = target.trim();
            if target.is_empty() {
                return Err(malformed());
            }
            return Ok(Some(target.to_string()));
        }

        rest = remaining.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    }

    Ok(None)
}

/// Resolves a `Link` target against the registry base URL.
///
/// The target must stay on the registry's origin (scheme, host and port);
/// the next page is requested with the registry's credentials.
///
/// # Errors
///
/// Returns a protocol error when either URL cannot be parsed or the target
/// points at another origin.
pub fn resolve_link(base: &str, target: &str) -> Result<String> {
    let base = Url::parse(base)
        .map_err(|e| RegistryError::protocol(format!("invalid registry URL '{base}': {e}")))?;
    let resolved = base
        .join(target)
        .map_err(|e| RegistryError::protocol(format!("invalid Link target '{target}': {e}")))?;
    if resolved.origin() != base.origin() {
        return Err(RegistryError::protocol(format!(
            "Link target '{target}' leaves registry {}",
            base.origin().ascii_serialization()
        )));
    }
    Ok(resolved.into())
}

/// Lazy, restartable sequence of tag pages for one repository.
///
/// Created by [`ManifestClient::list_tags`]. A failed request leaves the
/// pager where it was, so calling [`next_page`](Self::next_page) again
/// retries the same page. A malformed `Link` header, or one pointing at a
/// page already fetched, ends the sequence.
#[derive(Debug)]
pub struct TagPager<'a> {
    client: &'a ManifestClient,
    repo: RegistryRepo,
    options: RequestOptions,
    first_url: String,
    next_url: Option<String>,
    visited: HashSet<String>,
    page_limit: Option<usize>,
    pages_fetched: usize,
}

impl<'a> TagPager<'a> {
    pub(crate) fn new(
        client: &'a ManifestClient,
        repo: RegistryRepo,
        options: RequestOptions,
    ) -> Self {
        let config = client.config();
        let first_url = format!(
            "{}/v2/{}/tags/list?n={}",
            repo.index.base_url(),
            repo.remote_name,
            config.page_size
        );
        Self {
            client,
            page_limit: config.page_limit,
            repo,
            options,
            next_url: Some(first_url.clone()),
            first_url,
            visited: HashSet::new(),
            pages_fetched: 0,
        }
    }

    /// Repository being listed.
    #[must_use]
    pub const fn repo(&self) -> &RegistryRepo {
        &self.repo
    }

    /// Number of pages fetched since creation or the last restart.
    #[must_use]
    pub const fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Returns true once no further page will be fetched.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.next_url.is_none() || self.limit_reached()
    }

    /// Fetches the next page of tags.
    ///
    /// Returns `Ok(None)` when the registry sent no further `Link`, the page
    /// limit is reached, or [`stop`](Self::stop) was called.
    ///
    /// # Errors
    ///
    /// Returns the request error for a failed page. A page whose `Link`
    /// header cannot be parsed, leaves the registry or points back at a
    /// fetched page yields a protocol error whose
    /// [`partial_tags`](RegistryError::partial_tags) hold that page's tags.
    pub async fn next_page(&mut self) -> Result<Option<Vec<String>>> {
        if self.limit_reached() {
            return Ok(None);
        }
        let Some(url) = self.next_url.clone() else {
            return Ok(None);
        };

        let page = self.pages_fetched + 1;
        tracing::debug!(repository = %self.repo, page, url = %url, "fetching tag page");

        let response = self
            .client
            .fetch_tag_page(&self.repo, &url, &self.options)
            .await?;
        let tags = serde_json::from_slice::<TagList>(&response.body)?.tags;
        self.pages_fetched = page;
        self.visited.insert(url);

        self.next_url = match self.next_target(&response) {
            Ok(next) => next,
            Err(err) => {
                self.next_url = None;
                tracing::warn!(repository = %self.repo, page, error = %err, "stopping tag pagination");
                return Err(RegistryError::Protocol {
                    message: err.to_string(),
                    partial_tags: tags,
                });
            }
        };

        tracing::debug!(
            repository = %self.repo,
            page,
            tags = tags.len(),
            more = self.next_url.is_some(),
            "received tag page"
        );
        Ok(Some(tags))
    }

    /// Ends the sequence; later calls to [`next_page`](Self::next_page)
    /// return `Ok(None)`.
    pub fn stop(&mut self) {
        self.next_url = None;
    }

    /// Rewinds the sequence to the first page.
    pub fn restart(&mut self) {
        self.next_url = Some(self.first_url.clone());
        self.visited.clear();
        self.pages_fetched = 0;
    }

    /// Drains the remaining pages into one list.
    ///
    /// # Errors
    ///
    /// Propagates the first page error. A protocol error is re-raised with
    /// every tag gathered so far as its partial result.
    pub async fn collect_tags(&mut self) -> Result<Vec<String>> {
        let mut all = Vec::new();
        loop {
            match self.next_page().await {
                Ok(Some(tags)) => all.extend(tags),
                Ok(None) => return Ok(all),
                Err(RegistryError::Protocol {
                    message,
                    partial_tags,
                }) => {
                    all.extend(partial_tags);
                    return Err(RegistryError::Protocol {
                        message,
                        partial_tags: all,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Resolves the `next` link of a page, refusing pages already fetched.
    fn next_target(&self, response: &HttpResponse) -> Result<Option<String>> {
        let Some(link) = response.header("link") else {
            return Ok(None);
        };
        let Some(target) = parse_next_link(link)? else {
            return Ok(None);
        };
        let next = resolve_link(&self.repo.index.base_url(), &target)?;
        if self.visited.contains(&next) {
            return Err(RegistryError::protocol(format!(
                "Link header points back at fetched page {next}"
            )));
        }
        Ok(Some(next))
    }

    fn limit_reached(&self) -> bool {
        self.page_limit
            .is_some_and(|limit| self.pages_fetched >= limit)
    }
}
