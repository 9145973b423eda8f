use oauth2::basic::BasicErrorResponseType;
use oauth2::reqwest::Error as ReqwestClientError;
use oauth2::{HttpClientError, RequestTokenError, StandardErrorResponse};
use sqlx::Error as SqlxError;
use std::time::Duration;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum SyncError {
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] SqlxError),

    #[error("No credentials stored for service '{0}'")]
    CredentialsNotFound(String),

    #[error("Credentials for '{service}' missing required field '{field}'")]
    CredentialsMissing {
        service: String,
        field: &'static str,
    },

    #[error("Token refresh failed for '{service}': {reason}")]
    TokenRefreshFailed { service: String, reason: String },

    #[error("OAuth2 token request error: {0}")]
    Oauth2Token(String),

    #[error("OAuth2 server error: {error}")]
    Oauth2Server { error: String },

    #[error("Provider rejected the request: HTTP {status}")]
    ClientError { status: u16 },

    #[error("Provider server error after retry: HTTP {status}")]
    ServerError { status: u16 },

    #[error("Provider quota exhausted (retry after {retry_after:?})")]
    QuotaExceeded { retry_after: Option<Duration> },

    #[error("Upsert into '{table}' failed after {committed} committed rows: {source}")]
    UpsertFailed {
        table: String,
        committed: u64,
        #[source]
        source: SqlxError,
    },

    #[error("Invalid destination identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Credential crypto error: {0}")]
    Crypto(String),

    #[error("Malformed provider payload: {0}")]
    Payload(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Marks errors worth another attempt at the transport level. Status-code
/// classification (429/5xx/4xx) is the executor's job, not this trait's.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for SyncError {
    fn is_retryable(&self) -> bool {
        match self {
            SyncError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            SyncError::Oauth2Token(_) => true,
            SyncError::ServerError { .. } => true,
            _ => false,
        }
    }
}

impl
    From<
        RequestTokenError<
            HttpClientError<ReqwestClientError>,
            StandardErrorResponse<BasicErrorResponseType>,
        >,
    > for SyncError
{
    fn from(
        e: RequestTokenError<
            HttpClientError<ReqwestClientError>,
            StandardErrorResponse<BasicErrorResponseType>,
        >,
    ) -> Self {
        match e {
            RequestTokenError::ServerResponse(err) => SyncError::Oauth2Server {
                error: err.error().to_string(),
            },
            RequestTokenError::Request(req_e) => {
                SyncError::Oauth2Token(format!("request failed: {}", req_e))
            }
            RequestTokenError::Parse(parse_err, _body) => SyncError::Json(parse_err.into_inner()),
            RequestTokenError::Other(s) => SyncError::Oauth2Token(s),
        }
    }
}
