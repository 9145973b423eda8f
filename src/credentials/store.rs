use super::crypto::CredentialCipher;
use super::{AuthScheme, CredentialBundle};
use crate::db::SqlitePool;
use crate::error::SyncError;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Encrypted credential persistence, one row per service.
///
/// Bundles are written by an out-of-band bootstrap and mutated here only via
/// [`CredentialStore::update`], which merges field-by-field (the counterpart
/// to the sink's replace-on-conflict semantics for entity records).
#[derive(Clone)]
pub struct CredentialStore {
    pool: SqlitePool,
    cipher: Arc<CredentialCipher>,
}

impl CredentialStore {
    pub fn new(pool: SqlitePool, cipher: CredentialCipher) -> Self {
        Self {
            pool,
            cipher: Arc::new(cipher),
        }
    }

    pub async fn get(&self, service: &str) -> Result<CredentialBundle, SyncError> {
        let row = sqlx::query(
            r#"SELECT service, scheme, secret, expires_at, updated_at
               FROM service_credentials WHERE service = ?"#,
        )
        .bind(service)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SyncError::CredentialsNotFound(service.to_string()))?;
        self.row_to_bundle(row)
    }

    /// Bootstrap/ops path: store a whole bundle, replacing any prior row.
    pub async fn insert(&self, bundle: &CredentialBundle) -> Result<(), SyncError> {
        let secret = self.cipher.encrypt(&bundle.fields)?;
        sqlx::query(
            r#"
            INSERT INTO service_credentials (service, scheme, secret, expires_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(service) DO UPDATE SET
                scheme=excluded.scheme,
                secret=excluded.secret,
                expires_at=excluded.expires_at,
                updated_at=excluded.updated_at
            "#,
        )
        .bind(&bundle.service)
        .bind(bundle.scheme.as_str())
        .bind(secret)
        .bind(bundle.expires_at.map(|t| t.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Merge-upsert: only supplied fields overwrite; scheme and unrelated
    /// fields survive. `new_expires_at = None` leaves the stored expiry
    /// untouched.
    pub async fn update(
        &self,
        service: &str,
        updates: BTreeMap<String, String>,
        new_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), SyncError> {
        let mut current = self.get(service).await?;
        current.merge(updates, new_expires_at);

        let secret = self.cipher.encrypt(&current.fields)?;
        sqlx::query(
            r#"UPDATE service_credentials
               SET secret = ?, expires_at = ?, updated_at = ?
               WHERE service = ?"#,
        )
        .bind(secret)
        .bind(current.expires_at.map(|t| t.to_rfc3339()))
        .bind(current.updated_at.to_rfc3339())
        .bind(service)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_bundle(&self, row: SqliteRow) -> Result<CredentialBundle, SyncError> {
        let service: String = row.try_get("service")?;
        let scheme_str: String = row.try_get("scheme")?;
        let secret: Vec<u8> = row.try_get("secret")?;
        let expires_str: Option<String> = row.try_get("expires_at")?;
        let updated_str: String = row.try_get("updated_at")?;

        let fields = self.cipher.decrypt(&secret)?;
        let expires_at = expires_str
            .map(|s| parse_rfc3339(&s))
            .transpose()?;

        Ok(CredentialBundle {
            service,
            scheme: AuthScheme::parse(&scheme_str)?,
            fields,
            expires_at,
            updated_at: parse_rfc3339(&updated_str)?,
        })
    }
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, SyncError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::Database(sqlx::Error::Decode(Box::new(e))))
}
