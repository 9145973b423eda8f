mod jwt_bearer;
mod oauth2_refresh;

use crate::credentials::store::CredentialStore;
use crate::credentials::{AuthScheme, CredentialBundle};
use crate::error::{IsRetryable, SyncError};
use crate::http::oauth1::Oauth1Signer;
use crate::http::{RequestAuthorizer, TokenPlacement};
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, TimeDelta, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

fn default_retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(3))
        .with_max_times(3)
        .with_jitter()
}

/// A usable access token plus the metadata needed for margin checks.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub secret: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub issued_at: DateTime<Utc>,
}

/// What a scheme-specific refresh protocol hands back.
pub(crate) struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<Duration>,
    pub scope: Option<String>,
}

/// Owns the credential store handle, the process-local token cache, and the
/// refresh throttle. One instance per engine; the cache is an explicit field
/// rather than a global so tests get isolation for free.
pub struct TokenLifecycleManager {
    store: CredentialStore,
    http: reqwest::Client,
    cache: Mutex<HashMap<String, AccessToken>>,
    refresh_limiter: Arc<DefaultDirectRateLimiter>,
}

impl TokenLifecycleManager {
    pub fn new(store: CredentialStore, http: reqwest::Client, refresh_per_minute: u32) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(refresh_per_minute.max(1)).unwrap_or(NonZeroU32::MIN),
        );
        Self {
            store,
            http,
            cache: Mutex::new(HashMap::new()),
            refresh_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Return a token guaranteed (barring refresh failure, which raises) to
    /// outlive the safety margin. Cache hit, stored-token reuse, and
    /// scheme-specific refresh, in that order.
    pub async fn get_valid_token(
        &self,
        service: &str,
        force_refresh: bool,
    ) -> Result<AccessToken, SyncError> {
        if !force_refresh {
            let cache = self.cache.lock().await;
            if let Some(token) = cache.get(service) {
                if let Some(expires_at) = token.expires_at {
                    let margin = margin_for(token.issued_at, expires_at);
                    if Utc::now() + margin < expires_at {
                        debug!(service = %service, "serving cached token");
                        return Ok(token.clone());
                    }
                }
            }
        }

        let bundle = self.store.get(service).await?;
        bundle.validate()?;

        let needs_refresh = force_refresh
            || match bundle.expires_at {
                None => true,
                Some(expires_at) => {
                    Utc::now() + margin_for(bundle.updated_at, expires_at) >= expires_at
                }
            };

        let token = if needs_refresh {
            self.refresh(&bundle).await.map_err(|e| match e {
                e @ SyncError::CredentialsMissing { .. } => e,
                e => SyncError::TokenRefreshFailed {
                    service: service.to_string(),
                    reason: e.to_string(),
                },
            })?
        } else {
            AccessToken {
                secret: bundle.require(bundle.scheme.token_field())?.to_string(),
                expires_at: bundle.expires_at,
                issued_at: bundle.updated_at,
            }
        };

        self.cache
            .lock()
            .await
            .insert(service.to_string(), token.clone());
        Ok(token)
    }

    /// Build the per-request auth strategy for a service. OAuth1 bypasses the
    /// token path entirely; its secrets sign every request individually.
    pub async fn authorizer(
        &self,
        service: &str,
        placement: &TokenPlacement,
        force_refresh: bool,
    ) -> Result<RequestAuthorizer, SyncError> {
        let bundle = self.store.get(service).await?;
        if bundle.scheme == AuthScheme::Oauth1Signed {
            bundle.validate()?;
            return Ok(RequestAuthorizer::Oauth1(Oauth1Signer::from_bundle(&bundle)?));
        }

        let token = self.get_valid_token(service, force_refresh).await?;
        Ok(match placement {
            TokenPlacement::Bearer => RequestAuthorizer::Bearer(token.secret),
            TokenPlacement::Basic { password } => RequestAuthorizer::Basic {
                username: token.secret,
                password: password.clone(),
            },
            TokenPlacement::Header(name) => RequestAuthorizer::Header {
                name: name.clone(),
                value: token.secret,
            },
        })
    }

    /// On success the new secrets are merged into the stored bundle and the
    /// fresh token returned. On failure both cache and store stay untouched.
    async fn refresh(&self, bundle: &CredentialBundle) -> Result<AccessToken, SyncError> {
        if !bundle.scheme.refreshable() {
            // Static keys, PATs and OAuth1 secrets have nothing to exchange.
            return Ok(AccessToken {
                secret: bundle.require(bundle.scheme.token_field())?.to_string(),
                expires_at: bundle.expires_at,
                issued_at: bundle.updated_at,
            });
        }

        self.refresh_limiter.until_ready().await;

        let retry_policy = default_retry_policy();
        let refreshed = match bundle.scheme {
            AuthScheme::Oauth2Refresh => {
                (|| async { oauth2_refresh::refresh_access_token(bundle, self.http.clone()).await })
                    .retry(retry_policy)
                    .when(|e: &SyncError| e.is_retryable())
                    .notify(|err, dur: Duration| {
                        warn!(service = %bundle.service, error = %err, "retrying token refresh after {:?}", dur);
                    })
                    .await?
            }
            AuthScheme::JwtBearer => {
                (|| async { jwt_bearer::exchange_assertion(bundle, self.http.clone()).await })
                    .retry(retry_policy)
                    .when(|e: &SyncError| e.is_retryable())
                    .notify(|err, dur: Duration| {
                        warn!(service = %bundle.service, error = %err, "retrying assertion exchange after {:?}", dur);
                    })
                    .await?
            }
            // refreshable() gates the static schemes above.
            AuthScheme::Oauth1Signed
            | AuthScheme::StaticApiKey
            | AuthScheme::PersonalAccessToken => {
                return Err(SyncError::TokenRefreshFailed {
                    service: bundle.service.clone(),
                    reason: "scheme has no refresh protocol".to_string(),
                });
            }
        };

        let issued_at = Utc::now();
        let expires_at = refreshed
            .expires_in
            .map(|d| issued_at + TimeDelta::seconds(d.as_secs() as i64));

        let mut updates = BTreeMap::new();
        updates.insert(
            bundle.scheme.token_field().to_string(),
            refreshed.access_token.clone(),
        );
        if let Some(rt) = refreshed.refresh_token {
            updates.insert("refresh_token".to_string(), rt);
        }
        if let Some(scope) = refreshed.scope {
            updates.insert("scope".to_string(), scope);
        }
        self.store
            .update(&bundle.service, updates, expires_at)
            .await?;

        info!(
            service = %bundle.service,
            expires_at = ?expires_at,
            "token refreshed and stored"
        );
        Ok(AccessToken {
            secret: refreshed.access_token,
            expires_at,
            issued_at,
        })
    }
}

/// Safety margin scaled to the token lifetime: a tenth of it, clamped to
/// 5-60 minutes. Long-lived tokens refresh well ahead of expiry, short-lived
/// ones are not refreshed on every call.
fn margin_for(issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> TimeDelta {
    let lifetime = expires_at - issued_at;
    (lifetime / 10).clamp(TimeDelta::minutes(5), TimeDelta::minutes(60))
}
