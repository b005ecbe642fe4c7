//! Request-level entry points tying classification, dispatch and history together.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::classifier::classify;
use crate::config::PipelineConfig;
use crate::dispatcher::Dispatcher;
use crate::domain::classification::ClassificationResult;
use crate::domain::dispatch::{BulkDispatchSummary, MessagePayload};
use crate::domain::recipient::{CanonicalIdentifier, normalize};
use crate::error::{Result, VolleyError};
use crate::history::HistoryRecorder;
use crate::rate_gate::RateGate;
use crate::store::RecipientStore;
use crate::transport::Transport;

/// One bulk send as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Raw identifiers, in the order they should be attempted
    pub recipients: Vec<String>,
    pub payload: MessagePayload,
    /// Merged into each successfully reached recipient's stored metadata
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl SendRequest {
    pub fn new(recipients: Vec<String>, payload: MessagePayload) -> Self {
        Self {
            recipients,
            payload,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Bulk messaging front door.
///
/// Owns the dispatcher, the history worker and (unless the gates are shared)
/// the rate-gate cleanup tasks. Must be constructed inside a tokio runtime.
/// Dropping the sender stops its background tasks; [`shutdown`](Self::shutdown)
/// additionally waits for queued history to be written.
///
/// Classification is a separate preflight ([`check_recipients`](Self::check_recipients))
/// so the caller can decide who to send to; [`send_bulk`](Self::send_bulk) sends
/// to the recipients it is given and reports malformed ones as `InvalidFormat`.
///
/// Messages go out from the transport's sender number
/// ([`Transport::sender`]), which must already be canonical.
///
/// # Example
/// ```ignore
/// let transport = Arc::new(ReqwestTransport::new(TransportConfig::from_env()?)?);
/// let store = Arc::new(InMemoryRecipientStore::new());
/// let sender = BulkSender::new(PipelineConfig::default(), store, transport)?;
///
/// let check = sender.check_recipients(&raw).await?;
/// let summary = sender
///     .send_bulk(&SendRequest::new(raw, MessagePayload::freeform("hi")), &cancel)
///     .await?;
/// sender.shutdown().await;
/// ```
pub struct BulkSender<S, T>
where
    S: RecipientStore + 'static,
    T: Transport,
{
    config: PipelineConfig,
    store: Arc<S>,
    dispatcher: Dispatcher<T>,
    gates: Vec<Arc<RateGate>>,
    history: HistoryRecorder,
    /// Cancels the history worker and gate cleanup when the sender goes away
    shutdown: DropGuard,
    background: Vec<JoinHandle<()>>,
}

impl<S, T> BulkSender<S, T>
where
    S: RecipientStore + 'static,
    T: Transport,
{
    /// Build a sender with its own per-second and per-minute gates.
    pub fn new(config: PipelineConfig, store: Arc<S>, transport: Arc<T>) -> Result<Self> {
        config.validate()?;
        let gates = vec![
            Arc::new(RateGate::per_second(config.max_per_second)?),
            Arc::new(RateGate::per_minute(config.max_per_minute)?),
        ];
        let shutdown = CancellationToken::new();
        let background = gates
            .iter()
            .map(|gate| gate.spawn_cleanup(config.cleanup_interval(), shutdown.clone()))
            .collect();
        Self::assemble(config, store, transport, gates, shutdown, background)
    }

    /// Build a sender on gates shared with other senders in the process.
    ///
    /// The caller owns the gates' cleanup; `max_per_second` and `max_per_minute`
    /// in `config` are ignored in favor of the gates' own limits.
    pub fn with_rate_gates(
        config: PipelineConfig,
        store: Arc<S>,
        transport: Arc<T>,
        gates: Vec<Arc<RateGate>>,
    ) -> Result<Self> {
        config.validate()?;
        if gates.is_empty() {
            return Err(VolleyError::Configuration(
                "at least one rate gate is required".to_string(),
            ));
        }
        Self::assemble(
            config,
            store,
            transport,
            gates,
            CancellationToken::new(),
            Vec::new(),
        )
    }

    fn assemble(
        config: PipelineConfig,
        store: Arc<S>,
        transport: Arc<T>,
        gates: Vec<Arc<RateGate>>,
        shutdown: CancellationToken,
        background: Vec<JoinHandle<()>>,
    ) -> Result<Self> {
        // Cancel anything already spawned if construction fails below.
        let shutdown_guard = shutdown.clone().drop_guard();

        CanonicalIdentifier::try_from_canonical(transport.sender()).map_err(|e| {
            VolleyError::Configuration(format!("sender number is not canonical: {e}"))
        })?;

        let dispatcher = Dispatcher::new(transport, gates.clone())
            .with_scope(config.scope.clone())
            .with_send_timeout(config.send_timeout());
        let history = HistoryRecorder::spawn(store.clone(), shutdown.clone());

        tracing::info!(
            scope = %config.scope,
            gates = gates.len(),
            max_batch_size = config.max_batch_size,
            "Bulk sender ready"
        );

        Ok(Self {
            config,
            store,
            dispatcher,
            gates,
            history,
            shutdown: shutdown_guard,
            background,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn rate_gates(&self) -> &[Arc<RateGate>] {
        &self.gates
    }

    /// Classify `raw` against recipient history without sending anything.
    #[tracing::instrument(skip(self, raw), fields(count = raw.len()))]
    pub async fn check_recipients(&self, raw: &[String]) -> Result<ClassificationResult> {
        self.check_batch_size(raw.len())?;
        classify(raw, self.store.as_ref()).await
    }

    /// Validate, dispatch and queue history for one request.
    ///
    /// Request-bound violations fail with [`VolleyError::Validation`] before
    /// any send. Per-recipient failures are reported in the summary.
    #[tracing::instrument(skip(self, request, cancel), fields(count = request.recipients.len()))]
    pub async fn send_bulk(
        &self,
        request: &SendRequest,
        cancel: &CancellationToken,
    ) -> Result<BulkDispatchSummary> {
        self.validate_request(request)?;

        let mut raw_by_canonical: HashMap<String, String> = HashMap::new();
        let identifiers: Vec<String> = request
            .recipients
            .iter()
            .map(|raw| {
                let canonical = normalize(raw);
                raw_by_canonical
                    .entry(canonical.clone())
                    .or_insert_with(|| raw.clone());
                canonical
            })
            .collect();

        let summary = self
            .dispatcher
            .dispatch(&identifiers, &request.payload, cancel)
            .await;

        let queued = self.history.record_summary(
            &summary,
            &request.payload,
            &request.metadata,
            |canonical| {
                raw_by_canonical
                    .get(canonical.as_str())
                    .cloned()
                    .unwrap_or_else(|| canonical.to_string())
            },
        );
        tracing::debug!(dispatch_id = %summary.dispatch_id, queued, "Queued history updates");

        Ok(summary)
    }

    /// Whether the transport accepts its credentials.
    pub async fn health_check(&self) -> Result<bool> {
        self.dispatcher.transport().validate_credentials().await
    }

    /// Stop background tasks, waiting for queued history to be written.
    pub async fn shutdown(self) {
        self.shutdown.disarm().cancel();
        self.history.close().await;
        for handle in self.background {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background task failed during shutdown");
            }
        }
        tracing::info!("Bulk sender stopped");
    }

    fn check_batch_size(&self, len: usize) -> Result<()> {
        if len > self.config.max_batch_size {
            return Err(VolleyError::Validation(format!(
                "batch of {len} recipients exceeds the maximum of {}",
                self.config.max_batch_size
            )));
        }
        Ok(())
    }

    fn validate_request(&self, request: &SendRequest) -> Result<()> {
        if request.recipients.is_empty() {
            return Err(VolleyError::Validation(
                "at least one recipient is required".to_string(),
            ));
        }
        self.check_batch_size(request.recipients.len())?;

        match &request.payload {
            MessagePayload::Freeform { body } => {
                if body.trim().is_empty() {
                    return Err(VolleyError::Validation(
                        "message body must not be empty".to_string(),
                    ));
                }
                let length = body.chars().count();
                if length > self.config.max_message_length {
                    return Err(VolleyError::Validation(format!(
                        "message body is {length} characters, the maximum is {}",
                        self.config.max_message_length
                    )));
                }
            }
            MessagePayload::Template { template_ref, .. } => {
                if template_ref.trim().is_empty() {
                    return Err(VolleyError::Validation(
                        "template reference must not be empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRecipientStore;
    use crate::transport::MockTransport;
    use std::time::Duration;

    type TestSender = BulkSender<InMemoryRecipientStore, MockTransport>;

    fn sender(config: PipelineConfig) -> (TestSender, MockTransport) {
        let mock = MockTransport::new();
        let store = Arc::new(InMemoryRecipientStore::new());
        let sender = BulkSender::new(config, store, Arc::new(mock.clone())).unwrap();
        (sender, mock)
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = PipelineConfig {
            max_per_second: 0,
            ..Default::default()
        };
        let result = BulkSender::new(
            config,
            Arc::new(InMemoryRecipientStore::new()),
            Arc::new(MockTransport::new()),
        );
        assert!(matches!(result, Err(VolleyError::Configuration(_))));

        for sender_number in ["not a number", "+1 415 523 8886"] {
            let result = BulkSender::new(
                PipelineConfig::default(),
                Arc::new(InMemoryRecipientStore::new()),
                Arc::new(MockTransport::new().with_sender(sender_number)),
            );
            assert!(matches!(result, Err(VolleyError::Configuration(_))));
        }
    }

    #[tokio::test]
    async fn test_request_bounds() {
        let config = PipelineConfig {
            max_batch_size: 2,
            max_message_length: 5,
            ..Default::default()
        };
        let (sender, mock) = sender(config);
        let cancel = CancellationToken::new();
        let two = vec!["+15550000001".to_string(), "+15550000002".to_string()];

        let cases = [
            SendRequest::new(vec![], MessagePayload::freeform("hi")),
            SendRequest::new(
                vec!["+15550000001".to_string(); 3],
                MessagePayload::freeform("hi"),
            ),
            SendRequest::new(two.clone(), MessagePayload::freeform("   ")),
            SendRequest::new(two.clone(), MessagePayload::freeform("123456")),
            SendRequest::new(two.clone(), MessagePayload::template("", vec![])),
        ];
        for request in &cases {
            let result = sender.send_bulk(request, &cancel).await;
            assert!(
                matches!(result, Err(VolleyError::Validation(_))),
                "expected validation error for {request:?}"
            );
        }
        assert_eq!(mock.call_count(), 0);

        // Length is counted in characters, not bytes
        let accented = SendRequest::new(two, MessagePayload::freeform("héllo"));
        assert!(sender.send_bulk(&accented, &cancel).await.is_ok());
        sender.shutdown().await;
    }

    #[tokio::test]
    async fn test_check_recipients_enforces_batch_size() {
        let config = PipelineConfig {
            max_batch_size: 1,
            ..Default::default()
        };
        let (sender, _) = sender(config);
        let result = sender
            .check_recipients(&["+15550000001".to_string(), "+15550000002".to_string()])
            .await;
        assert!(matches!(result, Err(VolleyError::Validation(_))));
        sender.shutdown().await;
    }

    #[tokio::test]
    async fn test_recipients_are_normalized_before_dispatch() {
        let (sender, mock) = sender(PipelineConfig::default());
        let request = SendRequest::new(
            vec!["+1 (555) 000-0001".to_string(), "0015550000002".to_string()],
            MessagePayload::freeform("hi"),
        );

        let summary = sender
            .send_bulk(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.total_sent, 2);
        assert_eq!(mock.sent_to(), vec!["+15550000001", "+15550000002"]);
        sender.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_check_reflects_transport() {
        let (sender, mock) = sender(PipelineConfig::default());
        assert!(sender.health_check().await.unwrap());
        mock.set_credentials_valid(false);
        assert!(!sender.health_check().await.unwrap());
        sender.shutdown().await;
    }

    #[tokio::test]
    async fn test_shared_gates_are_used() {
        let gates = vec![Arc::new(RateGate::per_second(100).unwrap())];
        let mock = MockTransport::new();
        let first = BulkSender::with_rate_gates(
            PipelineConfig::default(),
            Arc::new(InMemoryRecipientStore::new()),
            Arc::new(mock.clone()),
            gates.clone(),
        )
        .unwrap();
        let second = BulkSender::with_rate_gates(
            PipelineConfig::default(),
            Arc::new(InMemoryRecipientStore::new()),
            Arc::new(mock.clone()),
            gates.clone(),
        )
        .unwrap();

        let recipients = vec!["+15550000001".to_string()];
        let request = SendRequest::new(recipients, MessagePayload::freeform("hi"));
        let cancel = CancellationToken::new();
        first.send_bulk(&request, &cancel).await.unwrap();
        second.send_bulk(&request, &cancel).await.unwrap();

        assert_eq!(gates[0].in_window("whatsapp"), 2);
        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_messages_go_out_from_transport_sender() {
        let mock = MockTransport::new().with_sender("+15559990000");
        let sender = BulkSender::new(
            PipelineConfig::default(),
            Arc::new(InMemoryRecipientStore::new()),
            Arc::new(mock.clone()),
        )
        .unwrap();

        let recipients = vec!["+15550000001".to_string()];
        let request = SendRequest::new(recipients, MessagePayload::freeform("hi"));
        sender
            .send_bulk(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(mock.get_calls()[0].from, "+15559990000");
        sender.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_sender_stops_gate_cleanup() {
        let (sender, _) = sender(PipelineConfig::default());
        let gate = sender.rate_gates()[0].clone();
        assert!(Arc::strong_count(&gate) > 1);

        drop(sender);
        tokio::time::sleep(Duration::from_secs(600)).await;

        // Only this handle is left once the cleanup tasks have exited
        assert_eq!(Arc::strong_count(&gate), 1);
    }
}
