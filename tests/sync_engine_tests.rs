use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tributary::connector::{RestConnector, RestEndpoint};
use tributary::credentials::crypto::CredentialCipher;
use tributary::credentials::store::CredentialStore;
use tributary::credentials::{AuthScheme, CredentialBundle};
use tributary::db::{self, SqlitePool};
use tributary::error::SyncError;
use tributary::http::{RateLimitedExecutor, RetryTuning, TokenPlacement};
use tributary::orchestrator::SyncOrchestrator;
use tributary::sink::UpsertSink;
use tributary::state::{SyncStateStore, WindowOptions};
use tributary::token::TokenLifecycleManager;
use tributary::window::ChunkPolicy;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn key_b64() -> String {
    BASE64.encode([9u8; 32])
}

fn fast_tuning() -> RetryTuning {
    RetryTuning {
        default_retry_delay: Duration::from_millis(50),
        server_retry_delay: Duration::from_millis(50),
        max_rate_limit_wait: Duration::from_secs(60),
        rate_window: Duration::from_secs(3600),
    }
}

fn cred_store(pool: &SqlitePool) -> CredentialStore {
    CredentialStore::new(pool.clone(), CredentialCipher::from_base64(&key_b64()).unwrap())
}

async fn seed_pat(pool: &SqlitePool, service: &str) {
    let mut fields = BTreeMap::new();
    fields.insert("token".to_string(), "pat-1".to_string());
    cred_store(pool)
        .insert(&CredentialBundle::new(
            service,
            AuthScheme::PersonalAccessToken,
            fields,
        ))
        .await
        .unwrap();
}

fn engine(pool: &SqlitePool) -> SyncOrchestrator {
    let http = reqwest::Client::new();
    let tokens = TokenLifecycleManager::new(cred_store(pool), http.clone(), 600);
    SyncOrchestrator::new(
        tokens,
        RateLimitedExecutor::new(http, fast_tuning()),
        UpsertSink::new(pool.clone(), 500),
        SyncStateStore::new(pool.clone()),
        4,
    )
}

fn entity_endpoint(server: &MockServer) -> RestEndpoint {
    RestEndpoint {
        name: "entries".to_string(),
        url: Url::parse(&format!("{}/items", server.uri())).unwrap(),
        table: "entries".to_string(),
        conflict_key: "natural_id".to_string(),
        items_pointer: None,
        id_field: "id".to_string(),
        timestamp_field: Some("at".to_string()),
        start_param: Some("start".to_string()),
        end_param: Some("end".to_string()),
    }
}

fn connector(server: &MockServer, policy: ChunkPolicy, window: WindowOptions) -> RestConnector {
    RestConnector {
        service: "demo".to_string(),
        placement: TokenPlacement::Bearer,
        policy,
        window,
        masters: Vec::new(),
        entity: entity_endpoint(server),
    }
}

async fn table_count(pool: &SqlitePool, table: &str) -> i64 {
    let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap();
    n
}

// ---------------------------------------------------------------------------
// Token lifecycle
// ---------------------------------------------------------------------------

fn oauth2_bundle(server: &MockServer) -> CredentialBundle {
    let mut fields = BTreeMap::new();
    fields.insert("client_id".to_string(), "cid".to_string());
    fields.insert("client_secret".to_string(), "csecret".to_string());
    fields.insert("refresh_token".to_string(), "rt-1".to_string());
    fields.insert("access_token".to_string(), "old-at".to_string());
    fields.insert("token_uri".to_string(), format!("{}/token", server.uri()));
    CredentialBundle::new("fitbit", AuthScheme::Oauth2Refresh, fields)
}

#[tokio::test]
async fn expiring_token_is_refreshed_merged_and_cached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-at",
            "refresh_token": "rt-2",
            "token_type": "bearer",
            "expires_in": 28800
        })))
        .expect(1)
        .mount(&server)
        .await;

    let pool = db::connect("sqlite::memory:").await.unwrap();
    let store = cred_store(&pool);
    // Two minutes of validity left: inside any margin, must refresh.
    store
        .insert(&oauth2_bundle(&server).with_expiry(Utc::now() + TimeDelta::minutes(2)))
        .await
        .unwrap();

    let manager = TokenLifecycleManager::new(store.clone(), reqwest::Client::new(), 600);
    let token = manager.get_valid_token("fitbit", false).await.unwrap();
    assert_eq!(token.secret, "new-at");
    // Margin invariant: plenty of remaining validity on what was returned.
    assert!(token.expires_at.unwrap() - Utc::now() > TimeDelta::hours(7));

    // Merge semantics: new secrets in, unrelated fields untouched.
    let stored = store.get("fitbit").await.unwrap();
    assert_eq!(stored.field("access_token"), Some("new-at"));
    assert_eq!(stored.field("refresh_token"), Some("rt-2"));
    assert_eq!(stored.field("client_secret"), Some("csecret"));
    assert!(stored.expires_at.is_some());

    // Second call is served from the cache; expect(1) verifies on drop.
    let again = manager.get_valid_token("fitbit", false).await.unwrap();
    assert_eq!(again.secret, "new-at");
}

#[tokio::test]
async fn stored_token_with_ample_validity_is_reused_without_refresh() {
    let server = MockServer::start().await;
    // No /token mock mounted: any refresh attempt would error.
    let pool = db::connect("sqlite::memory:").await.unwrap();
    let store = cred_store(&pool);
    store
        .insert(&oauth2_bundle(&server).with_expiry(Utc::now() + TimeDelta::hours(10)))
        .await
        .unwrap();

    let manager = TokenLifecycleManager::new(store, reqwest::Client::new(), 600);
    let token = manager.get_valid_token("fitbit", false).await.unwrap();
    assert_eq!(token.secret, "old-at");
}

#[tokio::test]
async fn failed_refresh_raises_and_leaves_store_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant"
        })))
        .mount(&server)
        .await;

    let pool = db::connect("sqlite::memory:").await.unwrap();
    let store = cred_store(&pool);
    store
        .insert(&oauth2_bundle(&server).with_expiry(Utc::now() + TimeDelta::minutes(2)))
        .await
        .unwrap();

    let manager = TokenLifecycleManager::new(store.clone(), reqwest::Client::new(), 600);
    let err = manager.get_valid_token("fitbit", false).await.unwrap_err();
    assert!(matches!(err, SyncError::TokenRefreshFailed { .. }));

    let stored = store.get("fitbit").await.unwrap();
    assert_eq!(stored.field("access_token"), Some("old-at"));
    assert_eq!(stored.field("refresh_token"), Some("rt-1"));
}

#[tokio::test]
async fn missing_required_field_fails_before_any_network_call() {
    let server = MockServer::start().await;
    let pool = db::connect("sqlite::memory:").await.unwrap();
    let store = cred_store(&pool);
    let mut bundle = oauth2_bundle(&server);
    bundle.fields.remove("refresh_token");
    store.insert(&bundle).await.unwrap();

    let manager = TokenLifecycleManager::new(store, reqwest::Client::new(), 600);
    let err = manager.get_valid_token("fitbit", false).await.unwrap_err();
    assert!(matches!(err, SyncError::CredentialsMissing { .. }));
    assert_eq!(server.received_requests().await.unwrap_or_default().len(), 0);
}

// ---------------------------------------------------------------------------
// Full runs
// ---------------------------------------------------------------------------

/// Serves `ok_pages` one-record pages, then signals quota exhaustion.
struct QuotaAfter {
    ok_pages: usize,
    hits: AtomicUsize,
}

impl Respond for QuotaAfter {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.hits.fetch_add(1, Ordering::SeqCst);
        if n < self.ok_pages {
            let at = (Utc::now() - TimeDelta::days(1)).to_rfc3339();
            ResponseTemplate::new(200)
                .set_body_json(json!([{ "id": format!("rec-{n}"), "at": at }]))
        } else {
            ResponseTemplate::new(429).insert_header("Retry-After", "86400")
        }
    }
}

#[tokio::test]
async fn quota_mid_run_yields_partial_success_with_persisted_chunks() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(QuotaAfter {
            ok_pages: 2,
            hits: AtomicUsize::new(0),
        })
        .mount(&server)
        .await;

    let pool = db::connect("sqlite::memory:").await.unwrap();
    seed_pat(&pool, "demo").await;
    let engine = engine(&pool);

    // 6-day window in 2-day chunks: two succeed, the third hits the quota.
    let connector = connector(
        &server,
        ChunkPolicy::Forward {
            max_span: TimeDelta::days(2),
        },
        WindowOptions {
            default_days: 5,
            margin_days: 1,
        },
    );
    let report = engine.run_sync(&connector, false).await.unwrap();

    assert!(report.success);
    assert!(report.partial);
    assert!(report.errors.is_empty());
    assert_eq!(report.stats.get("entries"), Some(&2));
    assert_eq!(table_count(&pool, "entries").await, 2);

    // The watermark covers the persisted records.
    let mark = SyncStateStore::new(pool.clone())
        .get("demo", "entries")
        .await
        .unwrap()
        .unwrap();
    assert!(mark.last_record_at.is_some());

    let (status,): (String,) =
        sqlx::query_as("SELECT status FROM sync_log ORDER BY id DESC LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "partial");
}

#[tokio::test]
async fn hard_entity_failure_aborts_but_keeps_committed_chunks() {
    let server = MockServer::start().await;
    struct FailAfterOne {
        hits: AtomicUsize,
    }
    impl Respond for FailAfterOne {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            if self.hits.fetch_add(1, Ordering::SeqCst) == 0 {
                let at = (Utc::now() - TimeDelta::days(2)).to_rfc3339();
                ResponseTemplate::new(200).set_body_json(json!([{ "id": "rec-0", "at": at }]))
            } else {
                ResponseTemplate::new(500)
            }
        }
    }
    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(FailAfterOne {
            hits: AtomicUsize::new(0),
        })
        .mount(&server)
        .await;

    let pool = db::connect("sqlite::memory:").await.unwrap();
    seed_pat(&pool, "demo").await;
    let engine = engine(&pool);

    let connector = connector(
        &server,
        ChunkPolicy::Forward {
            max_span: TimeDelta::days(2),
        },
        WindowOptions {
            default_days: 5,
            margin_days: 1,
        },
    );
    let err = engine.run_sync(&connector, false).await.unwrap_err();
    assert!(matches!(err, SyncError::ServerError { .. }));

    // Chunk one stayed committed, and the run was logged as failed.
    assert_eq!(table_count(&pool, "entries").await, 1);
    let (status,): (String,) =
        sqlx::query_as("SELECT status FROM sync_log ORDER BY id DESC LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "failed");
}

/// Newest-first provider with an item cap: filters its fixed dataset by the
/// date-granular start/end query params, sorts descending, truncates.
struct NewestFirst {
    items: Vec<(String, DateTime<Utc>)>,
    cap: usize,
}

impl Respond for NewestFirst {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let params: BTreeMap<String, String> = request
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let start = params.get("start").cloned().unwrap_or_default();
        let end = params.get("end").cloned().unwrap_or_default();

        let mut matching: Vec<&(String, DateTime<Utc>)> = self
            .items
            .iter()
            .filter(|(_, ts)| {
                let day = ts.format("%Y-%m-%d").to_string();
                day >= start && day <= end
            })
            .collect();
        matching.sort_by(|a, b| b.1.cmp(&a.1));

        let page: Vec<serde_json::Value> = matching
            .into_iter()
            .take(self.cap)
            .map(|(id, ts)| json!({ "id": id, "at": ts.to_rfc3339() }))
            .collect();
        ResponseTemplate::new(200).set_body_json(serde_json::Value::Array(page))
    }
}

#[tokio::test]
async fn reverse_pagination_retrieves_everything_exactly_once() {
    let server = MockServer::start().await;
    // Eight items, one per day at noon, newest first under a 3-item cap.
    let items: Vec<(String, DateTime<Utc>)> = (1..=8)
        .map(|i| {
            let ts = (Utc::now() - TimeDelta::days(i))
                .date_naive()
                .and_hms_opt(12, 0, 0)
                .unwrap()
                .and_utc();
            (format!("tx-{i}"), ts)
        })
        .collect();
    let newest = items[0].1;
    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(NewestFirst { items, cap: 3 })
        .mount(&server)
        .await;

    let pool = db::connect("sqlite::memory:").await.unwrap();
    seed_pat(&pool, "demo").await;
    let engine = engine(&pool);

    let connector = connector(
        &server,
        ChunkPolicy::Backward { max_items: 3 },
        WindowOptions {
            default_days: 10,
            margin_days: 1,
        },
    );
    let report = engine.run_sync(&connector, false).await.unwrap();

    assert!(report.success);
    assert!(!report.partial);
    // All eight retrieved, boundary re-fetches deduplicated before the sink.
    assert_eq!(report.stats.get("entries"), Some(&8));
    assert_eq!(table_count(&pool, "entries").await, 8);

    let mark = SyncStateStore::new(pool.clone())
        .get("demo", "entries")
        .await
        .unwrap()
        .unwrap();
    let recorded = mark.last_record_at.unwrap();
    assert!((recorded - newest).num_seconds().abs() <= 1);
    assert_eq!(mark.last_record_id.as_deref(), Some("tx-1"));
}

#[tokio::test]
async fn replaying_a_run_is_idempotent() {
    let server = MockServer::start().await;
    let at = (Utc::now() - TimeDelta::days(1)).to_rfc3339();
    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "a", "at": at },
            { "id": "b", "at": at },
            { "id": "c", "at": at }
        ])))
        .mount(&server)
        .await;

    let pool = db::connect("sqlite::memory:").await.unwrap();
    seed_pat(&pool, "demo").await;
    let engine = engine(&pool);

    let connector = connector(
        &server,
        ChunkPolicy::Forward {
            max_span: TimeDelta::days(30),
        },
        WindowOptions::default(),
    );

    let first = engine.run_sync(&connector, false).await.unwrap();
    let second = engine.run_sync(&connector, false).await.unwrap();
    assert!(first.success && second.success);
    assert_eq!(first.stats.get("entries"), Some(&3));
    assert_eq!(second.stats.get("entries"), Some(&3));
    assert_eq!(table_count(&pool, "entries").await, 3);
}

#[tokio::test]
async fn master_failure_is_isolated_from_siblings_and_entity_sync() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "p1" }, { "id": "p2" }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tags"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let pool = db::connect("sqlite::memory:").await.unwrap();
    seed_pat(&pool, "demo").await;
    let engine = engine(&pool);

    let master = |name: &str| RestEndpoint {
        name: name.to_string(),
        url: Url::parse(&format!("{}/{}", server.uri(), name)).unwrap(),
        table: name.to_string(),
        conflict_key: "natural_id".to_string(),
        items_pointer: None,
        id_field: "id".to_string(),
        timestamp_field: None,
        start_param: None,
        end_param: None,
    };
    let connector = RestConnector {
        service: "demo".to_string(),
        placement: TokenPlacement::Bearer,
        policy: ChunkPolicy::Forward {
            max_span: TimeDelta::days(30),
        },
        window: WindowOptions::default(),
        masters: vec![master("projects"), master("tags")],
        entity: entity_endpoint(&server),
    };

    let report = engine.run_sync(&connector, false).await.unwrap();
    // One master failed: run is not a success, but nothing else was lost.
    assert!(!report.success);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("tags:"));
    assert_eq!(report.stats.get("projects"), Some(&2));
    assert_eq!(report.stats.get("entries"), Some(&0));
    assert_eq!(table_count(&pool, "projects").await, 2);
}
