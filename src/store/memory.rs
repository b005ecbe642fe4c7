//! In-memory recipient store.
//!
//! Backed by a `DashMap` keyed on the canonical identifier, so upserts are
//! atomic per key through the entry API. Also carries a lookup counter and
//! failure switches that the pipeline tests use to observe and break it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{RecipientRecord, RecipientStore, TemplateSendRecord, merge_metadata, metadata_object};
use crate::domain::recipient::CanonicalIdentifier;
use crate::error::{Result, VolleyError};

#[derive(Debug, Default)]
pub struct InMemoryRecipientStore {
    recipients: DashMap<CanonicalIdentifier, RecipientRecord>,
    template_sends: Mutex<Vec<TemplateSendRecord>>,
    lookups: AtomicUsize,
    fail_lookups: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryRecipientStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with already-known recipients.
    pub fn with_recipients<I, S>(raws: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let store = Self::new();
        for raw in raws {
            let raw = raw.as_ref();
            if let Ok(canonical) = CanonicalIdentifier::parse(raw) {
                let record = new_record(raw, &canonical, serde_json::Value::Null);
                store.recipients.insert(canonical, record);
            }
        }
        store
    }

    /// Number of `exists_by_canonical` calls served so far.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Make every lookup fail with a persistence error.
    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail with a persistence error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, canonical: &CanonicalIdentifier) -> Option<RecipientRecord> {
        self.recipients.get(canonical).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    pub fn template_sends(&self) -> Vec<TemplateSendRecord> {
        self.template_sends.lock().clone()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(VolleyError::Persistence(
                "recipient store is unavailable for writes".to_string(),
            ));
        }
        Ok(())
    }
}

fn new_record(
    raw: &str,
    canonical: &CanonicalIdentifier,
    metadata: serde_json::Value,
) -> RecipientRecord {
    let now = Utc::now();
    RecipientRecord {
        id: Uuid::new_v4(),
        raw: raw.to_string(),
        canonical: canonical.clone(),
        metadata: metadata_object(metadata),
        send_count: 0,
        last_sent_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl RecipientStore for InMemoryRecipientStore {
    async fn exists_by_canonical(
        &self,
        canonical: &CanonicalIdentifier,
    ) -> Result<Option<RecipientRecord>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(VolleyError::Persistence(format!(
                "lookup failed for {canonical}"
            )));
        }
        Ok(self.get(canonical))
    }

    async fn upsert_by_canonical(
        &self,
        raw: &str,
        canonical: &CanonicalIdentifier,
        metadata: serde_json::Value,
    ) -> Result<RecipientRecord> {
        self.check_writable()?;
        let record = self
            .recipients
            .entry(canonical.clone())
            .and_modify(|existing| {
                merge_metadata(&mut existing.metadata, metadata.clone());
                existing.updated_at = Utc::now();
            })
            .or_insert_with(|| new_record(raw, canonical, metadata.clone()))
            .value()
            .clone();
        Ok(record)
    }

    async fn increment_send_counters(&self, canonical: &CanonicalIdentifier) -> Result<()> {
        self.check_writable()?;
        match self.recipients.get_mut(canonical) {
            Some(mut entry) => {
                let now = Utc::now();
                entry.send_count += 1;
                entry.last_sent_at = Some(now);
                entry.updated_at = now;
                Ok(())
            }
            None => Err(VolleyError::Persistence(format!(
                "recipient {canonical} not found"
            ))),
        }
    }

    async fn append_template_send_record(
        &self,
        canonical: &CanonicalIdentifier,
        template_ref: &str,
        variables: &[String],
        external_message_id: &str,
        metadata: serde_json::Value,
    ) -> Result<Option<TemplateSendRecord>> {
        self.check_writable()?;
        let Some(recipient_id) = self.recipients.get(canonical).map(|entry| entry.id) else {
            return Ok(None);
        };

        let record = TemplateSendRecord {
            id: Uuid::new_v4(),
            recipient_id,
            canonical: canonical.clone(),
            template_ref: template_ref.to_string(),
            variables: variables.to_vec(),
            external_message_id: external_message_id.to_string(),
            metadata,
            sent_at: Utc::now(),
        };
        self.template_sends.lock().push(record.clone());
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn id(raw: &str) -> CanonicalIdentifier {
        CanonicalIdentifier::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_seeded_recipients_are_found() {
        let store = InMemoryRecipientStore::with_recipients(["+0987654321", "not a number"]);
        assert_eq!(store.len(), 1);
        assert!(store.exists_by_canonical(&id("+0987654321")).await.unwrap().is_some());
        assert!(store.exists_by_canonical(&id("+1234567890")).await.unwrap().is_none());
        assert_eq!(store.lookup_count(), 2);
    }

    #[tokio::test]
    async fn test_upsert_keeps_first_raw_and_merges_metadata() {
        let store = InMemoryRecipientStore::new();
        let canonical = id("+15551234567");

        let first = store
            .upsert_by_canonical("+1 555 123 4567", &canonical, json!({"source": "csv"}))
            .await
            .unwrap();
        let second = store
            .upsert_by_canonical("15551234567", &canonical, json!({"tag": "vip"}))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.raw, "+1 555 123 4567");
        assert_eq!(second.metadata, json!({"source": "csv", "tag": "vip"}));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_non_object_metadata_is_stored_as_object() {
        let store = InMemoryRecipientStore::new();
        let canonical = id("+15551234567");

        let first = store
            .upsert_by_canonical("+15551234567", &canonical, json!(["spring"]))
            .await
            .unwrap();
        assert_eq!(first.metadata, json!({"value": ["spring"]}));

        let second = store
            .upsert_by_canonical("+15551234567", &canonical, json!({"tag": "vip"}))
            .await
            .unwrap();
        assert_eq!(second.metadata, json!({"value": ["spring"], "tag": "vip"}));
    }

    #[tokio::test]
    async fn test_concurrent_upserts_create_one_row() {
        let store = Arc::new(InMemoryRecipientStore::new());
        let canonical = id("+15551234567");

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let canonical = canonical.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upsert_by_canonical("+15551234567", &canonical, json!({"writer": i}))
                    .await
                    .unwrap()
                    .id
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_increment_send_counters() {
        let store = InMemoryRecipientStore::with_recipients(["+15551234567"]);
        let canonical = id("+15551234567");

        store.increment_send_counters(&canonical).await.unwrap();
        store.increment_send_counters(&canonical).await.unwrap();

        let record = store.get(&canonical).unwrap();
        assert_eq!(record.send_count, 2);
        assert!(record.last_sent_at.is_some());

        let missing = store.increment_send_counters(&id("+19999999999")).await;
        assert!(matches!(missing, Err(VolleyError::Persistence(_))));
    }

    #[tokio::test]
    async fn test_template_record_requires_recipient() {
        let store = InMemoryRecipientStore::with_recipients(["+15551234567"]);

        let appended = store
            .append_template_send_record(
                &id("+15551234567"),
                "HX123",
                &["Ada".to_string()],
                "SM1",
                json!({"language": "en"}),
            )
            .await
            .unwrap();
        assert!(appended.is_some());

        let missing = store
            .append_template_send_record(&id("+19999999999"), "HX123", &[], "SM2", json!({}))
            .await
            .unwrap();
        assert!(missing.is_none());
        assert_eq!(store.template_sends().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_switches() {
        let store = InMemoryRecipientStore::new();
        store.set_fail_lookups(true);
        assert!(store.exists_by_canonical(&id("+15551234567")).await.is_err());

        store.set_fail_writes(true);
        let result = store
            .upsert_by_canonical("+15551234567", &id("+15551234567"), json!({}))
            .await;
        assert!(matches!(result, Err(VolleyError::Persistence(_))));
    }
}
