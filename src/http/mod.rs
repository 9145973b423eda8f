pub mod oauth1;

use crate::error::SyncError;
use chrono::Utc;
use oauth1::Oauth1Signer;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use url::Url;
use tracing::warn;

/// A provider call described independently of the HTTP client, so the
/// executor can rebuild (and re-sign) it on every retry attempt.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: Url,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: Url, body: Value) -> Self {
        Self {
            method: Method::POST,
            url,
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Where a connector wants its token placed on the wire.
#[derive(Debug, Clone)]
pub enum TokenPlacement {
    Bearer,
    /// HTTP basic with the token as username, e.g. Toggl's `token:api_token`.
    Basic { password: String },
    Header(String),
}

/// Ready-to-apply auth material for one service, produced by the token
/// manager once per run.
pub enum RequestAuthorizer {
    Bearer(String),
    Basic { username: String, password: String },
    Header { name: String, value: String },
    Oauth1(Oauth1Signer),
}

impl RequestAuthorizer {
    fn apply(&self, request: &ApiRequest, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            RequestAuthorizer::Bearer(token) => builder.bearer_auth(token),
            RequestAuthorizer::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            RequestAuthorizer::Header { name, value } => {
                builder.header(name.as_str(), value.as_str())
            }
            RequestAuthorizer::Oauth1(signer) => builder.header(
                reqwest::header::AUTHORIZATION,
                signer.authorization_header(&request.method, &request.url, &request.query),
            ),
        }
    }
}

/// Knobs for the classification loop; defaults mirror the providers'
/// observed behavior (1s fallback waits, 5-minute quota cutoff).
#[derive(Debug, Clone)]
pub struct RetryTuning {
    pub default_retry_delay: Duration,
    pub server_retry_delay: Duration,
    /// A 429 hinting a wait beyond this is reported as quota exhaustion
    /// instead of being slept through.
    pub max_rate_limit_wait: Duration,
    pub rate_window: Duration,
}

impl Default for RetryTuning {
    fn default() -> Self {
        Self {
            default_retry_delay: Duration::from_secs(1),
            server_retry_delay: Duration::from_secs(1),
            max_rate_limit_wait: Duration::from_secs(300),
            rate_window: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimitState {
    request_count: u64,
    window_start: Instant,
}

impl RateLimitState {
    fn track(&mut self, window: Duration) {
        if self.window_start.elapsed() >= window {
            self.request_count = 0;
            self.window_start = Instant::now();
        }
        self.request_count += 1;
    }
}

/// Issues one provider call with classification-based retries:
/// - `< 400` returns,
/// - 429 sleeps out the provider's hint and retries unboundedly (or reports
///   quota exhaustion past the configured budget),
/// - 5xx retries exactly once,
/// - any other 4xx propagates immediately.
///
/// Also keeps a per-service rolling request counter for self-throttling
/// telemetry.
pub struct RateLimitedExecutor {
    client: reqwest::Client,
    tuning: RetryTuning,
    ledger: Mutex<HashMap<String, RateLimitState>>,
}

impl RateLimitedExecutor {
    pub fn new(client: reqwest::Client, tuning: RetryTuning) -> Self {
        Self {
            client,
            tuning,
            ledger: Mutex::new(HashMap::new()),
        }
    }

    pub async fn execute(
        &self,
        service: &str,
        request: &ApiRequest,
        auth: &RequestAuthorizer,
    ) -> Result<reqwest::Response, SyncError> {
        let mut server_retried = false;
        loop {
            self.track(service).await;
            let resp = self.build(request, auth).send().await?;
            let status = resp.status();

            if status.as_u16() < 400 {
                return Ok(resp);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = wait_hint(resp.headers()).unwrap_or(self.tuning.default_retry_delay);
                if wait > self.tuning.max_rate_limit_wait {
                    warn!(
                        service = %service,
                        wait_secs = wait.as_secs(),
                        "quota exhausted, giving the window back to the caller"
                    );
                    return Err(SyncError::QuotaExceeded {
                        retry_after: Some(wait),
                    });
                }
                warn!(service = %service, "rate limited (429), waiting {:?}", wait);
                tokio::time::sleep(wait).await;
                continue;
            }

            if status.is_server_error() {
                if !server_retried {
                    server_retried = true;
                    warn!(
                        service = %service,
                        status = status.as_u16(),
                        "server error, retrying once"
                    );
                    tokio::time::sleep(self.tuning.server_retry_delay).await;
                    continue;
                }
                return Err(SyncError::ServerError {
                    status: status.as_u16(),
                });
            }

            return Err(SyncError::ClientError {
                status: status.as_u16(),
            });
        }
    }

    /// Requests issued for a service inside the current rolling window.
    pub async fn requests_in_window(&self, service: &str) -> u64 {
        let ledger = self.ledger.lock().await;
        match ledger.get(service) {
            Some(state) if state.window_start.elapsed() < self.tuning.rate_window => {
                state.request_count
            }
            _ => 0,
        }
    }

    async fn track(&self, service: &str) {
        let mut ledger = self.ledger.lock().await;
        ledger
            .entry(service.to_string())
            .or_insert(RateLimitState {
                request_count: 0,
                window_start: Instant::now(),
            })
            .track(self.tuning.rate_window);
    }

    fn build(&self, request: &ApiRequest, auth: &RequestAuthorizer) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        auth.apply(request, builder)
    }
}

/// Provider wait hint: `Retry-After` in seconds, else an epoch-based
/// `X-RateLimit-Reset`.
fn wait_hint(headers: &HeaderMap) -> Option<Duration> {
    if let Some(secs) = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_secs(secs));
    }

    if let Some(reset_epoch) = headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
    {
        let wait = reset_epoch - Utc::now().timestamp();
        if wait > 0 {
            return Some(Duration::from_secs(wait as u64));
        }
    }

    None
}
