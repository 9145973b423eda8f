use super::RefreshedToken;
use crate::credentials::CredentialBundle;
use crate::error::SyncError;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenPayload {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Service-account flow: sign an RS256 assertion with the bundle's private
/// key and trade it for an access token at the bundle's token endpoint.
pub(super) async fn exchange_assertion(
    bundle: &CredentialBundle,
    http_client: reqwest::Client,
) -> Result<RefreshedToken, SyncError> {
    let token_uri = bundle.require("token_uri")?.to_string();
    let assertion = signed_assertion(bundle)?;

    let resp = http_client
        .post(&token_uri)
        .form(&[("grant_type", GRANT_TYPE), ("assertion", assertion.as_str())])
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(SyncError::Oauth2Server {
            error: format!("assertion exchange returned {status}: {body}"),
        });
    }

    let payload: TokenPayload = resp.json().await?;
    info!(service = %bundle.service, "bearer-assertion grant succeeded");

    Ok(RefreshedToken {
        access_token: payload.access_token,
        refresh_token: None,
        expires_in: payload.expires_in.map(Duration::from_secs),
        scope: payload.scope,
    })
}

fn signed_assertion(bundle: &CredentialBundle) -> Result<String, SyncError> {
    let key = EncodingKey::from_rsa_pem(bundle.require("private_key")?.as_bytes())
        .map_err(|e| SyncError::Crypto(format!("invalid RSA private key: {e}")))?;

    let now = Utc::now().timestamp();
    let claims = Claims {
        iss: bundle.require("client_email")?,
        scope: bundle.field("scope").unwrap_or(""),
        aud: bundle.require("token_uri")?,
        iat: now,
        exp: now + ASSERTION_LIFETIME_SECS,
    };

    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| SyncError::Crypto(format!("JWT signing failed: {e}")))
}
