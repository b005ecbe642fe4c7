//! Recipient history persistence.
//!
//! This module defines the [`RecipientStore`] trait the pipeline consumes for
//! duplicate lookups and send bookkeeping, plus the records it returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::recipient::CanonicalIdentifier;
use crate::error::Result;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryRecipientStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresRecipientStore;

/// A recipient already known to the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipientRecord {
    pub id: Uuid,
    /// Raw value as first submitted
    pub raw: String,
    pub canonical: CanonicalIdentifier,
    pub metadata: serde_json::Value,
    pub send_count: i64,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One template send, appended after the provider accepted it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateSendRecord {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub canonical: CanonicalIdentifier,
    pub template_ref: String,
    pub variables: Vec<String>,
    pub external_message_id: String,
    /// Includes the template language when one was given
    pub metadata: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

/// Storage trait for recipient history.
///
/// `upsert_by_canonical` must be atomic on the canonical key: concurrent
/// classify/record calls for the same new recipient never create two rows.
#[async_trait]
pub trait RecipientStore: Send + Sync {
    /// Look up a recipient by canonical identifier.
    async fn exists_by_canonical(
        &self,
        canonical: &CanonicalIdentifier,
    ) -> Result<Option<RecipientRecord>>;

    /// Insert the recipient, or merge metadata into the existing row.
    ///
    /// The stored raw value is the one from the first insert. Stored metadata
    /// is always a JSON object (see [`metadata_object`]) and later updates are
    /// merged into it key by key, so every implementation agrees on the result.
    async fn upsert_by_canonical(
        &self,
        raw: &str,
        canonical: &CanonicalIdentifier,
        metadata: serde_json::Value,
    ) -> Result<RecipientRecord>;

    /// Increment the send counter and stamp the last-sent time.
    async fn increment_send_counters(&self, canonical: &CanonicalIdentifier) -> Result<()>;

    /// Append a template send for an existing recipient.
    ///
    /// Returns `None` when no recipient row exists for `canonical`.
    async fn append_template_send_record(
        &self,
        canonical: &CanonicalIdentifier,
        template_ref: &str,
        variables: &[String],
        external_message_id: &str,
        metadata: serde_json::Value,
    ) -> Result<Option<TemplateSendRecord>>;
}

/// Coerce caller metadata into the object shape recipients store.
///
/// Null becomes `{}`, objects pass through and any other value is wrapped as
/// `{"value": ...}`.
pub fn metadata_object(metadata: serde_json::Value) -> serde_json::Value {
    match metadata {
        serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
        serde_json::Value::Object(_) => metadata,
        other => serde_json::json!({ "value": other }),
    }
}

/// Shallow-merge `update` into `base`, both coerced with [`metadata_object`].
///
/// Keys in `update` overwrite keys in `base`, matching JSONB `||` on objects.
pub(crate) fn merge_metadata(base: &mut serde_json::Value, update: serde_json::Value) {
    if !base.is_object() {
        *base = metadata_object(base.take());
    }
    if let (Some(existing), serde_json::Value::Object(incoming)) =
        (base.as_object_mut(), metadata_object(update))
    {
        existing.extend(incoming);
    }
}
