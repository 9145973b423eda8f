use crate::config::Config;
use crate::connector::{Connector, EntityStream, MapFn, MasterStream, NormalizedRecord};
use crate::credentials::crypto::CredentialCipher;
use crate::credentials::store::CredentialStore;
use crate::db::SqlitePool;
use crate::error::SyncError;
use crate::http::{ApiRequest, RateLimitedExecutor, RequestAuthorizer, RetryTuning};
use crate::sink::UpsertSink;
use crate::state::{RunStatus, SyncLogEntry, SyncStateStore, SyncWindow};
use crate::token::TokenLifecycleManager;
use crate::window::{ChunkPolicy, ChunkWindow, ReverseSession, chunk_forward};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// What a run hands back to the scheduler: aggregate success, per-stream
/// stats, collected errors, and elapsed time. Fetched-but-unsaved data is
/// never dropped silently; anything persisted is counted here.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub service: String,
    /// All master streams and the entity stream succeeded (quota-shortened
    /// runs still count as success).
    pub success: bool,
    /// Quota exhaustion stopped chunking early; persisted data was kept.
    pub partial: bool,
    pub stats: BTreeMap<String, u64>,
    pub errors: Vec<String>,
    pub api_calls: u64,
    pub elapsed_seconds: f64,
}

#[derive(Default)]
struct EntityOutcome {
    fetched: u64,
    upserted: u64,
    quota_hit: bool,
    observed: Option<(DateTime<Utc>, Option<String>)>,
    hard_error: Option<SyncError>,
}

impl EntityOutcome {
    fn observe(&mut self, records: &[NormalizedRecord], entity: &EntityStream) {
        for r in records {
            if let Some(ts) = (entity.timestamp)(&r.payload) {
                match &self.observed {
                    Some((current, _)) if *current >= ts => {}
                    _ => self.observed = Some((ts, Some(r.natural_id.clone()))),
                }
            }
        }
    }
}

/// Sequences one service's run: master fan-out, chunked entity sync, then
/// the watermark update. Master failures are isolated per stream; entity
/// failures other than quota exhaustion abort the run (committed batches
/// stay committed).
pub struct SyncOrchestrator {
    tokens: TokenLifecycleManager,
    executor: RateLimitedExecutor,
    sink: UpsertSink,
    state: SyncStateStore,
    master_concurrency: usize,
}

impl SyncOrchestrator {
    pub fn new(
        tokens: TokenLifecycleManager,
        executor: RateLimitedExecutor,
        sink: UpsertSink,
        state: SyncStateStore,
        master_concurrency: usize,
    ) -> Self {
        Self {
            tokens,
            executor,
            sink,
            state,
            master_concurrency: master_concurrency.max(1),
        }
    }

    /// Wire the whole engine from one pool and the loaded config.
    pub fn from_config(pool: SqlitePool, cfg: &Config) -> Result<Self, SyncError> {
        let cipher = CredentialCipher::from_base64(&cfg.encryption_key)?;
        let store = CredentialStore::new(pool.clone(), cipher);
        let http = build_http_client(cfg)?;
        let tokens = TokenLifecycleManager::new(store, http.clone(), cfg.refresh_per_minute);
        let executor = RateLimitedExecutor::new(
            http,
            RetryTuning {
                default_retry_delay: Duration::from_secs(cfg.default_retry_delay_secs),
                server_retry_delay: Duration::from_secs(cfg.server_retry_delay_secs),
                max_rate_limit_wait: Duration::from_secs(cfg.max_rate_limit_wait_secs),
                rate_window: Duration::from_secs(cfg.rate_window_secs),
            },
        );
        Ok(Self::new(
            tokens,
            executor,
            UpsertSink::new(pool.clone(), cfg.batch_size),
            SyncStateStore::new(pool),
            cfg.master_concurrency,
        ))
    }

    pub async fn run_sync(
        &self,
        connector: &dyn Connector,
        force_full: bool,
    ) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let started_at = Utc::now();
        let service = connector.service().to_string();
        info!(service = %service, "sync run starting");

        let calls_before = self.executor.requests_in_window(&service).await;
        let auth = self
            .tokens
            .authorizer(&service, &connector.token_placement(), false)
            .await?;

        let mut stats: BTreeMap<String, u64> = BTreeMap::new();
        let mut errors: Vec<String> = Vec::new();

        // Phase 1: master data, bounded fan-out, wait-all. A failed stream
        // lands in the error list without cancelling its siblings.
        let masters = connector.master_streams();
        for m in &masters {
            self.sink.ensure_table(&m.table, &m.conflict_key).await?;
        }
        let this = self;
        let svc = service.as_str();
        let auth_ref = &auth;
        let outcomes: Vec<(String, Result<u64, SyncError>)> =
            futures::stream::iter(masters.into_iter().map(move |stream| async move {
                let name = stream.name.clone();
                let result = this.sync_master(svc, &stream, auth_ref).await;
                (name, result)
            }))
            .buffer_unordered(self.master_concurrency)
            .collect()
            .await;
        for (name, result) in outcomes {
            match result {
                Ok(count) => {
                    stats.insert(name, count);
                }
                Err(e) => {
                    error!(service = %service, stream = %name, error = %e, "master stream failed");
                    errors.push(format!("{name}: {e}"));
                }
            }
        }

        // Phase 2: entity data, chunked against the watermark-derived window.
        let entity = connector.entity_stream();
        self.sink
            .ensure_table(&entity.table, &entity.conflict_key)
            .await?;
        let window = self
            .state
            .next_window(&service, &entity.name, connector.window_options(), force_full)
            .await?;
        info!(
            service = %service,
            stream = %entity.name,
            mode = window.mode.as_str(),
            start = %window.start,
            end = %window.end,
            "entity sync window"
        );

        let outcome = match connector.chunk_policy() {
            ChunkPolicy::Forward { max_span } => {
                self.sync_entity_forward(&service, &entity, &window, max_span, &auth)
                    .await
            }
            ChunkPolicy::Backward { max_items } => {
                self.sync_entity_backward(&service, &entity, &window, max_items, &auth)
                    .await
            }
        };
        stats.insert(entity.name.clone(), outcome.upserted);

        // Phase 3: the watermark moves only now, after entity sync finished
        // (fully or partially) and covers only durably persisted records.
        if let Some((mark, id)) = &outcome.observed {
            self.state
                .advance(&service, &entity.name, *mark, id.as_deref())
                .await?;
        } else {
            self.state.touch(&service, &entity.name).await?;
        }

        let api_calls = self
            .executor
            .requests_in_window(&service)
            .await
            .saturating_sub(calls_before);
        let elapsed = started.elapsed();
        let status = if outcome.hard_error.is_some() {
            RunStatus::Failed
        } else if outcome.quota_hit || !errors.is_empty() {
            RunStatus::Partial
        } else {
            RunStatus::Success
        };
        let log = SyncLogEntry {
            service: service.clone(),
            stream: entity.name.clone(),
            mode: window.mode,
            query_from: Some(window.start),
            query_to: Some(window.end),
            status,
            records_fetched: outcome.fetched,
            records_upserted: outcome.upserted,
            api_calls,
            error_message: outcome
                .hard_error
                .as_ref()
                .map(|e| e.to_string())
                .or_else(|| errors.first().cloned()),
            started_at,
            elapsed_ms: elapsed.as_millis() as i64,
        };
        if let Err(e) = self.state.log_run(&log).await {
            warn!(service = %service, error = %e, "failed to write sync log");
        }

        if let Some(e) = outcome.hard_error {
            error!(service = %service, error = %e, "entity sync aborted");
            return Err(e);
        }

        let success = errors.is_empty();
        info!(
            service = %service,
            success,
            partial = outcome.quota_hit,
            elapsed_secs = elapsed.as_secs_f64(),
            "sync run finished"
        );
        Ok(SyncReport {
            service,
            success,
            partial: outcome.quota_hit,
            stats,
            errors,
            api_calls,
            elapsed_seconds: elapsed.as_secs_f64(),
        })
    }

    async fn sync_master(
        &self,
        service: &str,
        stream: &MasterStream,
        auth: &RequestAuthorizer,
    ) -> Result<u64, SyncError> {
        let records = self
            .fetch_records(service, &stream.request, auth, &stream.map)
            .await?;
        self.sink
            .upsert(&stream.table, &records, &stream.conflict_key)
            .await
    }

    async fn sync_entity_forward(
        &self,
        service: &str,
        entity: &EntityStream,
        window: &SyncWindow,
        max_span: chrono::TimeDelta,
        auth: &RequestAuthorizer,
    ) -> EntityOutcome {
        let mut out = EntityOutcome::default();
        for chunk in chunk_forward(window.start, window.end, max_span) {
            let request = (entity.request)(&chunk);
            match self.fetch_records(service, &request, auth, &entity.map).await {
                Ok(records) => {
                    out.fetched += records.len() as u64;
                    match self
                        .sink
                        .upsert(&entity.table, &records, &entity.conflict_key)
                        .await
                    {
                        Ok(n) => {
                            out.upserted += n;
                            out.observe(&records, entity);
                        }
                        Err(e) => {
                            out.hard_error = Some(e);
                            break;
                        }
                    }
                }
                Err(SyncError::QuotaExceeded { retry_after }) => {
                    warn!(
                        service = %service,
                        retry_after = ?retry_after,
                        upserted = out.upserted,
                        "quota exhausted mid-run, reporting partial success"
                    );
                    out.quota_hit = true;
                    break;
                }
                Err(e) => {
                    out.hard_error = Some(e);
                    break;
                }
            }
        }
        out
    }

    async fn sync_entity_backward(
        &self,
        service: &str,
        entity: &EntityStream,
        window: &SyncWindow,
        max_items: usize,
        auth: &RequestAuthorizer,
    ) -> EntityOutcome {
        let mut out = EntityOutcome::default();
        let mut session = ReverseSession::new(
            ChunkWindow {
                start: window.start,
                end: window.end,
            },
            max_items,
        );
        while let Some(win) = session.next_window() {
            let request = (entity.request)(&win);
            match self.fetch_records(service, &request, auth, &entity.map).await {
                Ok(records) => {
                    out.fetched += records.len() as u64;
                    let mut keyed = Vec::with_capacity(records.len());
                    for r in &records {
                        match (entity.timestamp)(&r.payload) {
                            Some(ts) => keyed.push((r.natural_id.clone(), ts)),
                            None => {
                                out.hard_error = Some(SyncError::Payload(format!(
                                    "record '{}' has no timestamp; backward pagination needs one",
                                    r.natural_id
                                )));
                                return out;
                            }
                        }
                    }
                    let fresh: Vec<NormalizedRecord> = session
                        .absorb(&keyed)
                        .into_iter()
                        .map(|i| records[i].clone())
                        .collect();
                    match self
                        .sink
                        .upsert(&entity.table, &fresh, &entity.conflict_key)
                        .await
                    {
                        Ok(n) => {
                            out.upserted += n;
                            out.observe(&fresh, entity);
                        }
                        Err(e) => {
                            out.hard_error = Some(e);
                            break;
                        }
                    }
                }
                Err(SyncError::QuotaExceeded { retry_after }) => {
                    warn!(
                        service = %service,
                        retry_after = ?retry_after,
                        upserted = out.upserted,
                        "quota exhausted mid-run, reporting partial success"
                    );
                    out.quota_hit = true;
                    break;
                }
                Err(e) => {
                    out.hard_error = Some(e);
                    break;
                }
            }
        }
        out
    }

    async fn fetch_records(
        &self,
        service: &str,
        request: &ApiRequest,
        auth: &RequestAuthorizer,
        map: &MapFn,
    ) -> Result<Vec<NormalizedRecord>, SyncError> {
        let resp = self.executor.execute(service, request, auth).await?;
        let value: Value = resp.json().await?;
        (map)(&value)
    }
}

fn build_http_client(cfg: &Config) -> Result<reqwest::Client, SyncError> {
    let mut builder = reqwest::Client::builder()
        .user_agent("tributary-sync/0.1")
        .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
        .timeout(Duration::from_secs(cfg.request_timeout_secs));
    if let Some(proxy_url) = cfg.proxy.clone() {
        builder = builder.proxy(reqwest::Proxy::all(proxy_url.as_str())?);
    }
    Ok(builder.build()?)
}
