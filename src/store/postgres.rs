//! PostgreSQL implementation of [`RecipientStore`].
//!
//! Expects two tables to already exist:
//!
//! ```sql
//! CREATE TABLE recipients (
//!     id           UUID PRIMARY KEY,
//!     raw          TEXT NOT NULL,
//!     canonical    TEXT NOT NULL UNIQUE,
//!     metadata     JSONB NOT NULL DEFAULT '{}',
//!     send_count   BIGINT NOT NULL DEFAULT 0,
//!     last_sent_at TIMESTAMPTZ,
//!     created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE TABLE template_sends (
//!     id                  UUID PRIMARY KEY,
//!     recipient_id        UUID NOT NULL REFERENCES recipients(id) ON DELETE CASCADE,
//!     template_ref        TEXT NOT NULL,
//!     variables           JSONB NOT NULL,
//!     external_message_id TEXT NOT NULL,
//!     metadata            JSONB NOT NULL DEFAULT '{}',
//!     sent_at             TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use uuid::Uuid;

use super::{RecipientRecord, RecipientStore, TemplateSendRecord, metadata_object};
use crate::domain::recipient::CanonicalIdentifier;
use crate::error::{Result, VolleyError};

/// PostgreSQL-backed recipient history.
///
/// # Example
/// ```ignore
/// use volley::PostgresRecipientStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgresql://localhost/volley").await?;
/// let store = Arc::new(PostgresRecipientStore::new(pool));
/// ```
#[derive(Clone)]
pub struct PostgresRecipientStore {
    pool: PgPool,
}

impl PostgresRecipientStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn persistence(context: &str, e: sqlx::Error) -> VolleyError {
    VolleyError::Persistence(format!("{context}: {e}"))
}

fn recipient_from_row(row: &PgRow) -> Result<RecipientRecord> {
    let canonical: String = row
        .try_get("canonical")
        .map_err(|e| persistence("Failed to read canonical", e))?;
    let canonical = CanonicalIdentifier::try_from(canonical)
        .map_err(|e| VolleyError::Other(anyhow!("Corrupt recipient row: {}", e)))?;

    Ok(RecipientRecord {
        id: row
            .try_get("id")
            .map_err(|e| persistence("Failed to read id", e))?,
        raw: row
            .try_get("raw")
            .map_err(|e| persistence("Failed to read raw", e))?,
        canonical,
        metadata: row
            .try_get("metadata")
            .map_err(|e| persistence("Failed to read metadata", e))?,
        send_count: row
            .try_get("send_count")
            .map_err(|e| persistence("Failed to read send_count", e))?,
        last_sent_at: row
            .try_get("last_sent_at")
            .map_err(|e| persistence("Failed to read last_sent_at", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| persistence("Failed to read created_at", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| persistence("Failed to read updated_at", e))?,
    })
}

const RECIPIENT_COLUMNS: &str =
    "id, raw, canonical, metadata, send_count, last_sent_at, created_at, updated_at";

#[async_trait]
impl RecipientStore for PostgresRecipientStore {
    #[tracing::instrument(skip(self), fields(canonical = %canonical))]
    async fn exists_by_canonical(
        &self,
        canonical: &CanonicalIdentifier,
    ) -> Result<Option<RecipientRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECIPIENT_COLUMNS} FROM recipients WHERE canonical = $1"
        ))
        .bind(canonical.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| persistence("Failed to look up recipient", e))?;

        row.as_ref().map(recipient_from_row).transpose()
    }

    #[tracing::instrument(skip(self, raw, metadata), fields(canonical = %canonical))]
    async fn upsert_by_canonical(
        &self,
        raw: &str,
        canonical: &CanonicalIdentifier,
        metadata: serde_json::Value,
    ) -> Result<RecipientRecord> {
        let metadata = metadata_object(metadata);

        // Single statement so concurrent upserts for one canonical value
        // converge on the same row.
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO recipients (id, raw, canonical, metadata)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (canonical) DO UPDATE SET
                metadata = recipients.metadata || EXCLUDED.metadata,
                updated_at = NOW()
            RETURNING {RECIPIENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(raw)
        .bind(canonical.as_str())
        .bind(&metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| persistence("Failed to upsert recipient", e))?;

        recipient_from_row(&row)
    }

    #[tracing::instrument(skip(self), fields(canonical = %canonical))]
    async fn increment_send_counters(&self, canonical: &CanonicalIdentifier) -> Result<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE recipients SET
                send_count = send_count + 1,
                last_sent_at = NOW(),
                updated_at = NOW()
            WHERE canonical = $1
            "#,
        )
        .bind(canonical.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| persistence("Failed to increment send counters", e))?
        .rows_affected();

        if rows_affected == 0 {
            return Err(VolleyError::Persistence(format!(
                "recipient {canonical} not found"
            )));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, variables, metadata), fields(canonical = %canonical))]
    async fn append_template_send_record(
        &self,
        canonical: &CanonicalIdentifier,
        template_ref: &str,
        variables: &[String],
        external_message_id: &str,
        metadata: serde_json::Value,
    ) -> Result<Option<TemplateSendRecord>> {
        let variables_json = serde_json::to_value(variables)?;

        let row = sqlx::query(
            r#"
            INSERT INTO template_sends
                (id, recipient_id, template_ref, variables, external_message_id, metadata)
            SELECT $1, r.id, $3, $4, $5, $6
            FROM recipients r
            WHERE r.canonical = $2
            RETURNING id, recipient_id, sent_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(canonical.as_str())
        .bind(template_ref)
        .bind(&variables_json)
        .bind(external_message_id)
        .bind(&metadata)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| persistence("Failed to append template send", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(TemplateSendRecord {
            id: row
                .try_get("id")
                .map_err(|e| persistence("Failed to read id", e))?,
            recipient_id: row
                .try_get("recipient_id")
                .map_err(|e| persistence("Failed to read recipient_id", e))?,
            canonical: canonical.clone(),
            template_ref: template_ref.to_string(),
            variables: variables.to_vec(),
            external_message_id: external_message_id.to_string(),
            metadata,
            sent_at: row
                .try_get("sent_at")
                .map_err(|e| persistence("Failed to read sent_at", e))?,
        }))
    }
}
