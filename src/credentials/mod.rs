pub mod crypto;
pub mod store;

use crate::error::SyncError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a service authenticates and, when applicable, refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthScheme {
    Oauth2Refresh,
    Oauth1Signed,
    JwtBearer,
    StaticApiKey,
    PersonalAccessToken,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Oauth2Refresh => "oauth2-refresh",
            AuthScheme::Oauth1Signed => "oauth1-signed",
            AuthScheme::JwtBearer => "jwt-bearer",
            AuthScheme::StaticApiKey => "static-api-key",
            AuthScheme::PersonalAccessToken => "personal-access-token",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SyncError> {
        match s {
            "oauth2-refresh" => Ok(AuthScheme::Oauth2Refresh),
            "oauth1-signed" => Ok(AuthScheme::Oauth1Signed),
            "jwt-bearer" => Ok(AuthScheme::JwtBearer),
            "static-api-key" => Ok(AuthScheme::StaticApiKey),
            "personal-access-token" => Ok(AuthScheme::PersonalAccessToken),
            other => Err(SyncError::Config(format!("unknown auth scheme '{other}'"))),
        }
    }

    /// Fields a bundle must carry before the scheme can be exercised.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            AuthScheme::Oauth2Refresh => {
                &["client_id", "client_secret", "refresh_token", "token_uri"]
            }
            AuthScheme::Oauth1Signed => &[
                "consumer_key",
                "consumer_secret",
                "access_token",
                "access_token_secret",
            ],
            AuthScheme::JwtBearer => &["client_email", "private_key", "token_uri"],
            AuthScheme::StaticApiKey => &["api_key"],
            AuthScheme::PersonalAccessToken => &["token"],
        }
    }

    /// Which field holds the secret presented to the provider.
    pub fn token_field(&self) -> &'static str {
        match self {
            AuthScheme::Oauth2Refresh | AuthScheme::JwtBearer => "access_token",
            AuthScheme::Oauth1Signed => "access_token",
            AuthScheme::StaticApiKey => "api_key",
            AuthScheme::PersonalAccessToken => "token",
        }
    }

    /// Static-style schemes have nothing to exchange; refresh is a no-op.
    pub fn refreshable(&self) -> bool {
        matches!(self, AuthScheme::Oauth2Refresh | AuthScheme::JwtBearer)
    }
}

/// One service's stored secrets plus expiry metadata. The field map is
/// opaque to the engine; schemes only name the entries they need.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialBundle {
    pub service: String,
    pub scheme: AuthScheme,
    pub fields: BTreeMap<String, String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialBundle {
    pub fn new(
        service: impl Into<String>,
        scheme: AuthScheme,
        fields: BTreeMap<String, String>,
    ) -> Self {
        Self {
            service: service.into(),
            scheme,
            fields,
            expires_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn require(&self, field: &'static str) -> Result<&str, SyncError> {
        self.field(field)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| SyncError::CredentialsMissing {
                service: self.service.clone(),
                field,
            })
    }

    /// Fail fast before any network call when a declared-scheme field is
    /// absent.
    pub fn validate(&self) -> Result<(), SyncError> {
        for field in self.scheme.required_fields() {
            self.require(field)?;
        }
        Ok(())
    }

    /// Field-level merge: supplied entries overwrite, everything else stays.
    pub fn merge(
        &mut self,
        updates: BTreeMap<String, String>,
        new_expires_at: Option<DateTime<Utc>>,
    ) {
        self.fields.extend(updates);
        if let Some(exp) = new_expires_at {
            self.expires_at = Some(exp);
        }
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> CredentialBundle {
        let mut fields = BTreeMap::new();
        fields.insert("client_id".to_string(), "id".to_string());
        fields.insert("client_secret".to_string(), "secret".to_string());
        fields.insert("refresh_token".to_string(), "rt".to_string());
        fields.insert("token_uri".to_string(), "https://auth.test/token".to_string());
        fields.insert("access_token".to_string(), "at".to_string());
        CredentialBundle::new("fitbit", AuthScheme::Oauth2Refresh, fields)
    }

    #[test]
    fn validate_accepts_complete_oauth2_bundle() {
        assert!(bundle().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_required_field() {
        let mut b = bundle();
        b.fields.remove("refresh_token");
        match b.validate() {
            Err(SyncError::CredentialsMissing { service, field }) => {
                assert_eq!(service, "fitbit");
                assert_eq!(field, "refresh_token");
            }
            other => panic!("expected CredentialsMissing, got {other:?}"),
        }
    }

    #[test]
    fn empty_value_counts_as_missing() {
        let mut b = bundle();
        b.fields.insert("refresh_token".to_string(), String::new());
        assert!(b.validate().is_err());
    }

    #[test]
    fn merge_overwrites_only_supplied_fields() {
        let mut b = bundle();
        let mut updates = BTreeMap::new();
        updates.insert("access_token".to_string(), "new-at".to_string());
        let exp = Utc::now() + chrono::TimeDelta::hours(8);
        b.merge(updates, Some(exp));

        assert_eq!(b.field("access_token"), Some("new-at"));
        assert_eq!(b.field("refresh_token"), Some("rt"));
        assert_eq!(b.field("client_secret"), Some("secret"));
        assert_eq!(b.expires_at, Some(exp));
    }

    #[test]
    fn scheme_round_trips_through_strings() {
        for scheme in [
            AuthScheme::Oauth2Refresh,
            AuthScheme::Oauth1Signed,
            AuthScheme::JwtBearer,
            AuthScheme::StaticApiKey,
            AuthScheme::PersonalAccessToken,
        ] {
            assert_eq!(AuthScheme::parse(scheme.as_str()).unwrap(), scheme);
        }
        assert!(AuthScheme::parse("basic").is_err());
    }
}
