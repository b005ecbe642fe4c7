//! Detached recipient-history updates.
//!
//! Successful sends are queued on an unbounded channel and written to the
//! [`RecipientStore`] by a single background task. Write failures are logged
//! and counted, never retried and never reported back to the dispatch path.

use std::sync::Arc;

use metrics::counter;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::dispatch::{BulkDispatchSummary, DispatchId, MessagePayload};
use crate::domain::recipient::CanonicalIdentifier;
use crate::store::RecipientStore;

/// One successful send to record.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub dispatch_id: DispatchId,
    /// Raw value the caller submitted, stored on first insert
    pub raw: String,
    pub canonical: CanonicalIdentifier,
    pub external_message_id: String,
    pub payload: MessagePayload,
    /// Merged into the recipient's metadata
    pub metadata: serde_json::Value,
}

/// Handle to the history worker.
///
/// Dropping the recorder closes the queue; the worker finishes what is queued
/// and exits. [`close`](Self::close) does the same and waits for it.
pub struct HistoryRecorder {
    tx: mpsc::UnboundedSender<HistoryEntry>,
    handle: JoinHandle<()>,
}

impl HistoryRecorder {
    /// Start the worker. It stops once every queued entry is written after
    /// either the recorder is dropped or `shutdown` fires.
    pub fn spawn<S>(store: Arc<S>, shutdown: CancellationToken) -> Self
    where
        S: RecipientStore + ?Sized + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_worker(store, rx, shutdown));
        Self { tx, handle }
    }

    /// Queue one entry. Never blocks and never fails from the caller's side.
    pub fn record(&self, entry: HistoryEntry) {
        if self.tx.send(entry).is_err() {
            counter!("volley_history_failures_total", "step" => "enqueue").increment(1);
            tracing::error!("History worker has stopped; dropping history entry");
        }
    }

    /// Queue an entry for every successful outcome in `summary`.
    ///
    /// `raw_for` maps a canonical identifier back to the raw value the caller
    /// submitted for it.
    pub fn record_summary<F>(
        &self,
        summary: &BulkDispatchSummary,
        payload: &MessagePayload,
        metadata: &serde_json::Value,
        raw_for: F,
    ) -> usize
    where
        F: Fn(&CanonicalIdentifier) -> String,
    {
        let mut queued = 0;
        for outcome in summary.successes() {
            let (Ok(canonical), Some(external_message_id)) = (
                CanonicalIdentifier::try_from_canonical(&outcome.identifier),
                outcome.external_message_id.clone(),
            ) else {
                continue;
            };
            self.record(HistoryEntry {
                dispatch_id: summary.dispatch_id,
                raw: raw_for(&canonical),
                canonical,
                external_message_id,
                payload: payload.clone(),
                metadata: metadata.clone(),
            });
            queued += 1;
        }
        queued
    }

    /// Close the queue and wait for the worker to drain it.
    pub async fn close(self) {
        let Self { tx, handle } = self;
        drop(tx);
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "History worker panicked");
        }
    }
}

async fn run_worker<S>(
    store: Arc<S>,
    mut rx: mpsc::UnboundedReceiver<HistoryEntry>,
    shutdown: CancellationToken,
) where
    S: RecipientStore + ?Sized,
{
    tracing::debug!("History worker started");
    loop {
        tokio::select! {
            entry = rx.recv() => match entry {
                Some(entry) => apply(store.as_ref(), entry).await,
                None => break,
            },
            _ = shutdown.cancelled() => {
                tracing::info!("Shutting down history worker");
                rx.close();
                while let Some(entry) = rx.recv().await {
                    apply(store.as_ref(), entry).await;
                }
                break;
            }
        }
    }
    tracing::debug!("History worker stopped");
}

#[tracing::instrument(
    skip(store, entry),
    fields(dispatch_id = %entry.dispatch_id, canonical = %entry.canonical)
)]
async fn apply<S>(store: &S, entry: HistoryEntry)
where
    S: RecipientStore + ?Sized,
{
    if let Err(e) = store
        .upsert_by_canonical(&entry.raw, &entry.canonical, entry.metadata.clone())
        .await
    {
        counter!("volley_history_failures_total", "step" => "upsert").increment(1);
        tracing::error!(error = %e, "Failed to upsert recipient history");
        return;
    }

    if let Err(e) = store.increment_send_counters(&entry.canonical).await {
        counter!("volley_history_failures_total", "step" => "increment").increment(1);
        tracing::error!(error = %e, "Failed to increment send counters");
    }

    if let MessagePayload::Template {
        template_ref,
        language,
        variables,
    } = &entry.payload
    {
        let metadata = json!({
            "dispatch_id": entry.dispatch_id.0.to_string(),
            "language": language,
        });
        match store
            .append_template_send_record(
                &entry.canonical,
                template_ref,
                variables,
                &entry.external_message_id,
                metadata,
            )
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                counter!("volley_history_failures_total", "step" => "template").increment(1);
                tracing::error!("Recipient missing when appending template send");
            }
            Err(e) => {
                counter!("volley_history_failures_total", "step" => "template").increment(1);
                tracing::error!(error = %e, "Failed to append template send");
            }
        }
    }

    tracing::trace!("Recorded recipient history");
}
