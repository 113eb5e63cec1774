//! Integration tests for the registry client.
//!
//! These tests drive `ManifestClient` and the sync entry points through a
//! scripted in-memory transport that plays both the registry and its token
//! service.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use plugdex_registry::{
    compute_digest, fetch_versions, sync_plugins, AuthInfo, ErrorKind, HttpRequest, HttpResponse,
    ManifestClient, PluginSyncOutcome, RegistryConfig, RegistryError, RegistryRepo,
    RequestOptions, Result, RetryPolicy, Transport,
};

const REGISTRY: &str = "https://registry.example.com";
const REALM: &str = "https://auth.example.com/token";
const TAGS_PATH: &str = "/v2/acme/linter/tags/list";
const MANIFESTS_PATH: &str = "/v2/acme/linter/manifests/";

type Handler = Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

/// Scripted registry: answers every request with `handler` and records it.
struct MockRegistry {
    handler: Handler,
    delay: Duration,
    requests: Mutex<Vec<HttpRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockRegistry {
    fn new(handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static) -> Arc<Self> {
        Self::with_delay(Duration::ZERO, handler)
    }

    fn with_delay(
        delay: Duration,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            delay,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn count(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.starts_with(prefix))
            .count()
    }

    fn total(&self) -> usize {
        self.requests.lock().len()
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockRegistry {
    async fn call(&self, request: HttpRequest) -> Result<HttpResponse> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let response = (self.handler)(&request);
        self.requests.lock().push(request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(response)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn path(request: &HttpRequest) -> &str {
    request.url.strip_prefix(REGISTRY).unwrap_or(&request.url)
}

fn tags_url() -> String {
    format!("{REGISTRY}{TAGS_PATH}")
}

fn bearer_challenge() -> String {
    format!(
        r#"Bearer realm="{REALM}",service="registry.example.com",scope="repository:acme/linter:pull""#
    )
}

fn unauthorized() -> HttpResponse {
    HttpResponse::new(
        StatusCode::UNAUTHORIZED,
        r#"{"errors":[{"code":"UNAUTHORIZED","message":"authentication required"}]}"#,
    )
    .with_header("www-authenticate", &bearer_challenge())
}

fn token_response(token: &str) -> HttpResponse {
    HttpResponse::new(
        StatusCode::OK,
        json!({ "token": token, "expires_in": 300 }).to_string(),
    )
}

fn tags_page(tags: &[&str]) -> HttpResponse {
    HttpResponse::new(
        StatusCode::OK,
        json!({ "name": "acme/linter", "tags": tags }).to_string(),
    )
    .with_header("content-type", "application/json")
}

fn manifest_body(layers: &[u64], created: Option<&str>) -> String {
    let layers: Vec<_> = layers
        .iter()
        .enumerate()
        .map(|(i, size)| {
            json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": compute_digest(format!("layer-{i}-{size}").as_bytes()),
                "size": size,
            })
        })
        .collect();
    let mut manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": compute_digest(b"config"),
            "size": 7777,
        },
        "layers": layers,
    });
    if let Some(created) = created {
        manifest["annotations"] = json!({
            "org.opencontainers.image.created": created,
            "org.opencontainers.image.title": "linter",
        });
    }
    manifest.to_string()
}

fn manifest_response(body: &str) -> HttpResponse {
    HttpResponse::new(StatusCode::OK, body)
        .with_header("content-type", "application/vnd.oci.image.manifest.v1+json")
        .with_header("docker-content-digest", &compute_digest(body.as_bytes()))
}

fn not_found(code: &str) -> HttpResponse {
    HttpResponse::new(
        StatusCode::NOT_FOUND,
        json!({ "errors": [{ "code": code, "message": "not known to registry" }] }).to_string(),
    )
}

fn client(registry: &Arc<MockRegistry>) -> ManifestClient {
    client_with(registry, RegistryConfig::new().with_retry(RetryPolicy::none()))
}

fn client_with(registry: &Arc<MockRegistry>, config: RegistryConfig) -> ManifestClient {
    ManifestClient::with_transport(config, registry.clone()).unwrap()
}

fn linter(client: &ManifestClient) -> RegistryRepo {
    client.parse_repo("registry.example.com/acme/linter").unwrap()
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_bearer_negotiation_and_token_reuse() {
    let registry = MockRegistry::new(|request| {
        if request.url.starts_with(REALM) {
            assert!(request.url.contains("service=registry.example.com"));
            assert!(request.url.contains("scope=repository%3Aacme%2Flinter%3Apull"));
            return token_response("t1");
        }
        if request.header("authorization") != Some("Bearer t1") {
            return unauthorized();
        }
        tags_page(&["1.0.0", "latest"])
    });
    let client = client(&registry);
    let repo = linter(&client);

    let tags = client
        .list_tags(&repo, &RequestOptions::new())
        .collect_tags()
        .await
        .unwrap();
    assert_eq!(tags, vec!["1.0.0", "latest"]);

    // Unauthenticated attempt, token request, authenticated retry.
    assert_eq!(registry.total(), 3);
    assert_eq!(registry.count(REALM), 1);

    client
        .list_tags(&repo, &RequestOptions::new())
        .collect_tags()
        .await
        .unwrap();
    assert_eq!(registry.total(), 4);
    assert_eq!(registry.count(REALM), 1);
}

#[tokio::test]
async fn test_basic_challenge() {
    let registry = MockRegistry::new(|request| {
        if request.header("authorization") == Some("Basic dXNlcjpwYXNz") {
            tags_page(&["1.0.0"])
        } else {
            HttpResponse::new(StatusCode::UNAUTHORIZED, "")
                .with_header("www-authenticate", r#"Basic realm="registry""#)
        }
    });
    let config = RegistryConfig::new()
        .with_retry(RetryPolicy::none())
        .with_auth(AuthInfo::basic("user", "pass"));
    let client = client_with(&registry, config);
    let repo = linter(&client);

    let tags = client
        .list_tags(&repo, &RequestOptions::new())
        .collect_tags()
        .await
        .unwrap();
    assert_eq!(tags, vec!["1.0.0"]);
    assert_eq!(registry.total(), 2);
}

#[tokio::test]
async fn test_static_bearer_token_is_sent_directly() {
    let registry = MockRegistry::new(|request| {
        assert_eq!(request.header("authorization"), Some("Bearer pat"));
        tags_page(&["1.0.0"])
    });
    let config = RegistryConfig::new()
        .with_retry(RetryPolicy::none())
        .with_auth(AuthInfo::bearer("pat"));
    let client = client_with(&registry, config);
    let repo = linter(&client);

    client
        .list_tags(&repo, &RequestOptions::new())
        .collect_tags()
        .await
        .unwrap();
    assert_eq!(registry.total(), 1);
}

#[tokio::test]
async fn test_revoked_token_is_renegotiated_once() {
    let issued = Arc::new(AtomicUsize::new(0));
    let revoked = Arc::new(AtomicBool::new(false));
    let registry = {
        let issued = Arc::clone(&issued);
        let revoked = Arc::clone(&revoked);
        MockRegistry::new(move |request| {
            if request.url.starts_with(REALM) {
                let n = issued.fetch_add(1, Ordering::SeqCst) + 1;
                return token_response(&format!("t{n}"));
            }
            let accepted = if revoked.load(Ordering::SeqCst) { "Bearer t2" } else { "Bearer t1" };
            if request.header("authorization") == Some(accepted) {
                tags_page(&["1.0.0"])
            } else {
                unauthorized()
            }
        })
    };
    let client = client(&registry);
    let repo = linter(&client);

    client
        .list_tags(&repo, &RequestOptions::new())
        .collect_tags()
        .await
        .unwrap();
    revoked.store(true, Ordering::SeqCst);

    let before = registry.total();
    let tags = client
        .list_tags(&repo, &RequestOptions::new())
        .collect_tags()
        .await
        .unwrap();
    assert_eq!(tags, vec!["1.0.0"]);
    // Rejected t1, token request, accepted t2.
    assert_eq!(registry.total() - before, 3);
    assert_eq!(issued.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_persistent_rejection_is_an_auth_error() {
    let registry = MockRegistry::new(|request| {
        if request.url.starts_with(REALM) {
            token_response("useless")
        } else {
            unauthorized()
        }
    });
    let client = client(&registry);
    let repo = linter(&client);

    let err = client
        .list_tags(&repo, &RequestOptions::new())
        .collect_tags()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(registry.count(&tags_url()), 2);
    assert_eq!(registry.count(REALM), 1);
}

// =============================================================================
// Pagination
// =============================================================================

fn paged_registry() -> Arc<MockRegistry> {
    MockRegistry::new(|request| match path(request) {
        "/v2/acme/linter/tags/list?n=2" => tags_page(&["a", "b"]).with_header(
            "link",
            r#"</v2/acme/linter/tags/list?n=2&last=b>; rel="next""#,
        ),
        "/v2/acme/linter/tags/list?n=2&last=b" => tags_page(&["c", "d"]).with_header(
            "link",
            "<https://registry.example.com/v2/acme/linter/tags/list?n=2&last=d>; rel=next",
        ),
        "/v2/acme/linter/tags/list?n=2&last=d" => tags_page(&["e"]),
        other => panic!("unexpected request {other}"),
    })
}

#[tokio::test]
async fn test_tags_follow_link_headers() {
    let registry = paged_registry();
    let client = client_with(
        &registry,
        RegistryConfig::new()
            .with_retry(RetryPolicy::none())
            .with_page_size(2),
    );
    let repo = linter(&client);

    let mut pager = client.list_tags(&repo, &RequestOptions::new());
    assert_eq!(pager.collect_tags().await.unwrap(), vec!["a", "b", "c", "d", "e"]);
    assert_eq!(pager.pages_fetched(), 3);
    assert!(pager.is_done());
    assert_eq!(pager.next_page().await.unwrap(), None);
}

#[tokio::test]
async fn test_pager_stop_restart_and_limit() {
    let registry = paged_registry();
    let client = client_with(
        &registry,
        RegistryConfig::new()
            .with_retry(RetryPolicy::none())
            .with_page_size(2),
    );
    let repo = linter(&client);

    let mut pager = client.list_tags(&repo, &RequestOptions::new());
    assert_eq!(pager.next_page().await.unwrap(), Some(vec!["a".to_string(), "b".to_string()]));
    pager.stop();
    assert_eq!(pager.next_page().await.unwrap(), None);
    assert_eq!(registry.total(), 1);

    pager.restart();
    assert_eq!(pager.pages_fetched(), 0);
    assert_eq!(pager.next_page().await.unwrap(), Some(vec!["a".to_string(), "b".to_string()]));

    let limited = client_with(
        &registry,
        RegistryConfig::new()
            .with_retry(RetryPolicy::none())
            .with_page_size(2)
            .with_page_limit(2),
    );
    let tags = limited
        .list_tags(&repo, &RequestOptions::new())
        .collect_tags()
        .await
        .unwrap();
    assert_eq!(tags, vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn test_malformed_link_keeps_partial_tags() {
    let registry = MockRegistry::new(|request| match path(request) {
        "/v2/acme/linter/tags/list?n=2" => tags_page(&["a", "b"]).with_header(
            "link",
            r#"</v2/acme/linter/tags/list?n=2&last=b>; rel="next""#,
        ),
        "/v2/acme/linter/tags/list?n=2&last=b" => {
            tags_page(&["c"]).with_header("link", "v2/acme/linter/tags/list; rel=next")
        }
        other => panic!("unexpected request {other}"),
    });
    let client = client_with(
        &registry,
        RegistryConfig::new()
            .with_retry(RetryPolicy::none())
            .with_page_size(2),
    );
    let repo = linter(&client);

    let mut pager = client.list_tags(&repo, &RequestOptions::new());
    pager.next_page().await.unwrap();
    let err = pager.next_page().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(err.partial_tags(), ["c".to_string()]);
    assert!(pager.is_done());

    pager.restart();
    let err = pager.collect_tags().await.unwrap_err();
    assert_eq!(err.partial_tags(), ["a", "b", "c"].map(String::from));
}

#[tokio::test]
async fn test_self_referencing_link_ends_paging() {
    let calls = AtomicUsize::new(0);
    let registry = MockRegistry::new(move |_| {
        assert!(calls.fetch_add(1, Ordering::SeqCst) < 10, "pager never stopped");
        tags_page(&["a", "b"]).with_header(
            "link",
            r#"</v2/acme/linter/tags/list?n=100>; rel="next""#,
        )
    });
    let client = client(&registry);
    let repo = linter(&client);

    let mut pager = client.list_tags(&repo, &RequestOptions::new());
    let err = pager.collect_tags().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(err.partial_tags(), ["a", "b"].map(String::from));
    assert_eq!(registry.total(), 1);
    assert!(pager.is_done());
}

#[tokio::test]
async fn test_link_cycle_ends_paging() {
    let registry = MockRegistry::new(|request| match path(request) {
        "/v2/acme/linter/tags/list?n=2" => tags_page(&["a", "b"]).with_header(
            "link",
            r#"</v2/acme/linter/tags/list?n=2&last=b>; rel="next""#,
        ),
        "/v2/acme/linter/tags/list?n=2&last=b" => tags_page(&["c"]).with_header(
            "link",
            r#"</v2/acme/linter/tags/list?n=2>; rel="next""#,
        ),
        other => panic!("unexpected request {other}"),
    });
    let client = client_with(
        &registry,
        RegistryConfig::new()
            .with_retry(RetryPolicy::none())
            .with_page_size(2),
    );
    let repo = linter(&client);

    let mut pager = client.list_tags(&repo, &RequestOptions::new());
    let err = pager.collect_tags().await.unwrap_err();
    assert_eq!(err.partial_tags(), ["a", "b", "c"].map(String::from));
    assert_eq!(registry.total(), 2);

    // A restart forgets the pages seen so far.
    pager.restart();
    assert_eq!(
        pager.next_page().await.unwrap(),
        Some(vec!["a".to_string(), "b".to_string()])
    );
}

#[tokio::test]
async fn test_link_to_another_host_is_not_followed() {
    let registry = MockRegistry::new(|request| {
        if request.header("authorization").is_none() {
            return HttpResponse::new(StatusCode::UNAUTHORIZED, "")
                .with_header("www-authenticate", r#"Basic realm="registry""#);
        }
        tags_page(&["1.0.0"]).with_header("link", "<https://evil.example.net/steal>; rel=next")
    });
    let config = RegistryConfig::new()
        .with_retry(RetryPolicy::none())
        .with_auth(AuthInfo::basic("user", "secret"));
    let client = client_with(&registry, config);
    let repo = linter(&client);

    let err = client
        .list_tags(&repo, &RequestOptions::new())
        .collect_tags()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(err.partial_tags(), ["1.0.0".to_string()]);
    assert_eq!(registry.count("https://evil.example.net"), 0);
    assert_eq!(registry.total(), 2);
}

#[tokio::test]
async fn test_null_tags_is_an_empty_page() {
    let registry = MockRegistry::new(|_| {
        HttpResponse::new(StatusCode::OK, r#"{"name":"acme/linter","tags":null}"#)
    });
    let client = client(&registry);
    let repo = linter(&client);

    let tags = client
        .list_tags(&repo, &RequestOptions::new())
        .collect_tags()
        .await
        .unwrap();
    assert!(tags.is_empty());
}

// =============================================================================
// Manifests
// =============================================================================

#[tokio::test]
async fn test_manifest_metadata() {
    let body = manifest_body(&[100, 250], Some("2024-03-01T12:00:00Z"));
    let expected_digest = compute_digest(body.as_bytes());
    let registry = {
        let body = body.clone();
        MockRegistry::new(move |request| {
            assert!(request
                .header("accept")
                .is_some_and(|accept| accept.contains("application/vnd.oci.image.index.v1+json")));
            manifest_response(&body)
        })
    };
    let client = client(&registry);
    let repo = linter(&client);

    let fetched = client
        .get_manifest(&repo, "1.0.0", &RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(fetched.digest, expected_digest);
    assert!(!fetched.manifest.is_index());

    let raw = client
        .query_tag_metadata(&repo, "1.0.0", &RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(raw.tag, "1.0.0");
    assert_eq!(raw.sha, expected_digest);
    assert_eq!(raw.size, 350);
    assert_eq!(
        raw.published_at.map(|t| t.to_rfc3339()),
        Some("2024-03-01T12:00:00+00:00".to_string())
    );
    assert_eq!(raw.annotations["org.opencontainers.image.title"], "linter");
}

#[tokio::test]
async fn test_unparsable_timestamp_is_absent() {
    let body = manifest_body(&[1], Some("yesterday"));
    let registry = MockRegistry::new(move |_| manifest_response(&body));
    let client = client(&registry);
    let repo = linter(&client);

    let raw = client
        .query_tag_metadata(&repo, "1.0.0", &RequestOptions::new())
        .await
        .unwrap();
    assert!(raw.published_at.is_none());
    assert_eq!(raw.size, 1);
}

#[tokio::test]
async fn test_index_has_zero_size() {
    let body = json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": compute_digest(b"child"),
            "size": 512,
            "platform": { "architecture": "amd64", "os": "linux" },
        }],
    })
    .to_string();
    let registry = MockRegistry::new(move |_| {
        HttpResponse::new(StatusCode::OK, body.as_str())
            .with_header("content-type", "application/vnd.oci.image.index.v1+json")
    });
    let client = client(&registry);
    let repo = linter(&client);

    let raw = client
        .query_tag_metadata(&repo, "1.0.0", &RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(raw.size, 0);
    assert!(raw.annotations.is_empty());
}

#[tokio::test]
async fn test_digest_mismatch() {
    let body = manifest_body(&[1], None);
    let registry = MockRegistry::new(move |_| {
        HttpResponse::new(StatusCode::OK, body.as_str())
            .with_header("docker-content-digest", &compute_digest(b"something else"))
    });
    let client = client(&registry);
    let repo = linter(&client);

    let err = client
        .get_manifest(&repo, "1.0.0", &RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DigestMismatch);
}

#[tokio::test]
async fn test_digest_reference_must_match_content() {
    let body = manifest_body(&[1], None);
    let actual = compute_digest(body.as_bytes());
    let registry = MockRegistry::new(move |_| HttpResponse::new(StatusCode::OK, body.as_str()));
    let client = client(&registry);
    let repo = linter(&client);

    let fetched = client
        .get_manifest(&repo, &actual, &RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(fetched.digest, actual);

    let wrong = compute_digest(b"other");
    let err = client
        .get_manifest(&repo, &wrong, &RequestOptions::new())
        .await
        .unwrap_err();
    match err {
        RegistryError::DigestMismatch { expected, actual: got, .. } => {
            assert_eq!(expected, wrong);
            assert_eq!(got, actual);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_schema_v1_is_unsupported() {
    let registry = MockRegistry::new(|_| {
        HttpResponse::new(
            StatusCode::OK,
            r#"{"schemaVersion":1,"name":"acme/linter","tag":"old","fsLayers":[]}"#,
        )
        .with_header(
            "content-type",
            "application/vnd.docker.distribution.manifest.v1+prettyjws",
        )
    });
    let client = client(&registry);
    let repo = linter(&client);

    let err = client
        .get_manifest(&repo, "old", &RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedManifest);
}

#[tokio::test]
async fn test_status_mapping() {
    let registry = MockRegistry::new(|request| match path(request) {
        p if p.ends_with("/missing") => not_found("MANIFEST_UNKNOWN"),
        p if p.ends_with("/busy") => {
            HttpResponse::new(StatusCode::TOO_MANY_REQUESTS, "").with_header("retry-after", "12")
        }
        _ => HttpResponse::new(
            StatusCode::BAD_REQUEST,
            r#"{"errors":[{"code":"TAG_INVALID","message":"manifest tag did not match","detail":{"tag":"x"}}]}"#,
        ),
    });
    let client = client(&registry);
    let repo = linter(&client);
    let options = RequestOptions::new();

    let err = client.get_manifest(&repo, "missing", &options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.code(), Some("MANIFEST_UNKNOWN"));

    let err = client.get_manifest(&repo, "busy", &options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimit);
    assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
    assert!(err.is_retryable());

    let err = client.get_manifest(&repo, "bad", &options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Http);
    assert_eq!(err.code(), Some("TAG_INVALID"));
    assert_eq!(err.api_errors()[0].detail, Some(json!({ "tag": "x" })));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_invalid_reference_makes_no_request() {
    let registry = MockRegistry::new(|_| panic!("no request expected"));
    let client = client(&registry);
    let repo = linter(&client);

    let err = client
        .get_manifest(&repo, "../etc", &RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
    assert_eq!(registry.total(), 0);
}

// =============================================================================
// Deadlines and cancellation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_deadline_is_a_timeout() {
    let registry = MockRegistry::with_delay(Duration::from_secs(30), |_| tags_page(&["1.0.0"]));
    let client = client(&registry);
    let repo = linter(&client);

    let options = RequestOptions::new().with_timeout(Duration::from_secs(1));
    let err = client
        .list_tags(&repo, &options)
        .collect_tags()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation() {
    let registry = MockRegistry::with_delay(Duration::from_secs(30), |_| tags_page(&["1.0.0"]));
    let client = client(&registry);
    let repo = linter(&client);

    let cancel = CancellationToken::new();
    let options = RequestOptions::new().with_cancel(cancel.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let err = client
        .get_manifest(&repo, "1.0.0", &options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    canceller.await.unwrap();

    let err = client
        .get_manifest(&repo, "1.0.0", &options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(registry.total(), 0);
}

// =============================================================================
// Sync
// =============================================================================

fn plugin_registry() -> Arc<MockRegistry> {
    let current = manifest_body(&[10, 20], Some("2024-05-01T00:00:00Z"));
    let previous = manifest_body(&[5], Some("2024-01-01T00:00:00Z"));
    MockRegistry::new(move |request| {
        let p = path(request);
        if p.starts_with(TAGS_PATH) {
            return tags_page(&["latest", "1.0", "0.9.0", "broken", "1.0.0"]);
        }
        if p.starts_with("/v2/acme/missing/") {
            return not_found("NAME_UNKNOWN");
        }
        match p.strip_prefix(MANIFESTS_PATH) {
            Some("latest" | "1.0" | "1.0.0") => manifest_response(&current),
            Some("0.9.0") => manifest_response(&previous),
            Some("broken") => HttpResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            _ => not_found("MANIFEST_UNKNOWN"),
        }
    })
}

#[tokio::test]
async fn test_fetch_versions_groups_by_digest() {
    let registry = plugin_registry();
    let client = client_with(
        &registry,
        RegistryConfig::new()
            .with_retry(RetryPolicy::none())
            .with_concurrency(2),
    );
    let repo = linter(&client);

    let report = fetch_versions(&client, &repo, &RequestOptions::new())
        .await
        .unwrap();

    assert_eq!(report.versions.len(), 2);
    let newest = &report.versions[0];
    assert_eq!(newest.canonical_tag, "1.0.0");
    assert_eq!(newest.additional_tags, vec!["latest", "1.0"]);
    assert_eq!(newest.size, 30);
    assert_eq!(report.versions[1].canonical_tag, "0.9.0");
    assert_eq!(report.versions[1].size, 5);

    assert!(!report.is_complete());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].tag, "broken");
    assert_eq!(report.failures[0].error.kind(), ErrorKind::Http);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_versions_retries_transient_failures() {
    let failures = Arc::new(AtomicUsize::new(0));
    let registry = {
        let failures = Arc::clone(&failures);
        let body = manifest_body(&[1], None);
        MockRegistry::new(move |request| {
            if path(request).starts_with(TAGS_PATH) {
                return tags_page(&["1.0.0"]);
            }
            if failures.fetch_add(1, Ordering::SeqCst) == 0 {
                HttpResponse::new(StatusCode::SERVICE_UNAVAILABLE, "")
            } else {
                manifest_response(&body)
            }
        })
    };
    let client = client_with(&registry, RegistryConfig::new());
    let repo = linter(&client);

    let report = fetch_versions(&client, &repo, &RequestOptions::new())
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.versions.len(), 1);
    assert_eq!(failures.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_sync_isolates_plugin_failures() {
    let registry = plugin_registry();
    let client = client(&registry);

    let outcomes = sync_plugins(
        &client,
        &[
            "registry.example.com/acme/linter",
            "registry.example.com/acme/missing",
            "not-a-path",
        ],
        &RequestOptions::new(),
    )
    .await;

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].plugin(), "registry.example.com/acme/linter");
    let record = outcomes[0].record().unwrap();
    assert_eq!(record.name, "linter");
    assert_eq!(record.latest.as_deref(), Some("1.0.0"));
    assert_eq!(record.versions.len(), 2);

    assert_eq!(outcomes[1].error().map(RegistryError::kind), Some(ErrorKind::NotFound));
    assert_eq!(outcomes[2].error().map(RegistryError::kind), Some(ErrorKind::Format));
}

fn fleet_registry(delay: Duration) -> Arc<MockRegistry> {
    let body = manifest_body(&[1, 2], None);
    MockRegistry::with_delay(delay, move |request| {
        let p = path(request);
        if p.contains("/tags/list") {
            tags_page(&["1.0.0", "1.1.0", "2.0.0"])
        } else if p.contains("/manifests/") {
            manifest_response(&body)
        } else {
            panic!("unexpected request {p}")
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_fetch_versions_respects_concurrency_cap() {
    let registry = fleet_registry(Duration::from_millis(10));
    let client = client_with(
        &registry,
        RegistryConfig::new()
            .with_retry(RetryPolicy::none())
            .with_concurrency(2),
    );
    let repo = linter(&client);

    let report = fetch_versions(&client, &repo, &RequestOptions::new())
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.versions.len(), 1);
    assert_eq!(registry.max_in_flight(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sync_respects_concurrency_cap_across_plugins() {
    let registry = fleet_registry(Duration::from_millis(10));
    let client = client_with(
        &registry,
        RegistryConfig::new()
            .with_retry(RetryPolicy::none())
            .with_concurrency(1),
    );
    let plugins: Vec<String> = (0..6)
        .map(|i| format!("registry.example.com/acme/plugin-{i}"))
        .collect();

    let outcomes = sync_plugins(&client, &plugins, &RequestOptions::new()).await;

    assert!(outcomes.iter().all(PluginSyncOutcome::is_synced));
    assert_eq!(registry.count(&format!("{REGISTRY}/v2/acme/plugin-")), registry.total());
    assert_eq!(registry.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_clones_share_the_concurrency_cap() {
    let registry = fleet_registry(Duration::from_millis(10));
    let client = client_with(
        &registry,
        RegistryConfig::new()
            .with_retry(RetryPolicy::none())
            .with_concurrency(3),
    );
    let repo = linter(&client);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            let repo = repo.clone();
            tokio::spawn(async move {
                client
                    .get_manifest(&repo, "1.0.0", &RequestOptions::new())
                    .await
                    .map(|fetched| fetched.digest)
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(registry.max_in_flight(), 3);
}
