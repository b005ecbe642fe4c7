//! Sequential, rate-gated dispatch of one payload to many recipients.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::domain::dispatch::{
    BulkDispatchSummary, DispatchErrorKind, DispatchId, DispatchOutcome, MessagePayload,
    OutboundMessage,
};
use crate::domain::recipient::CanonicalIdentifier;
use crate::rate_gate::RateGate;
use crate::transport::Transport;

/// Default scope shared by every gate of a dispatcher.
pub const DEFAULT_SCOPE: &str = "whatsapp";

/// Default bound on a single transport send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends one payload to a list of canonical identifiers, one at a time.
///
/// Every send first passes each rate gate in order, then runs under the send
/// timeout. A failed send never stops the batch; its outcome is recorded and
/// the next identifier is attempted.
pub struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    gates: Vec<Arc<RateGate>>,
    scope: String,
    send_timeout: Duration,
}

impl<T: Transport> Dispatcher<T> {
    /// `gates` are acquired in the given order for every send (short window first).
    /// Messages go out from the transport's own sender number.
    pub fn new(transport: Arc<T>, gates: Vec<Arc<RateGate>>) -> Self {
        Self {
            transport,
            gates,
            scope: DEFAULT_SCOPE.to_string(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Attempt every identifier in order and summarize the results.
    ///
    /// Identifiers are expected in canonical form and are re-validated here;
    /// malformed ones are recorded as [`DispatchErrorKind::InvalidFormat`]
    /// without a send. If `cancel` fires between identifiers or while waiting
    /// on a gate, the summary so far is returned with `cancelled` set and the
    /// remaining identifiers in `not_attempted`. An in-flight send is never
    /// interrupted by cancellation, only by the send timeout.
    #[tracing::instrument(
        skip(self, identifiers, payload, cancel),
        fields(count = identifiers.len(), template = payload.is_template())
    )]
    pub async fn dispatch(
        &self,
        identifiers: &[String],
        payload: &MessagePayload,
        cancel: &CancellationToken,
    ) -> BulkDispatchSummary {
        let dispatch_id = DispatchId::new();
        let mut summary = BulkDispatchSummary::new(dispatch_id);
        let outbound = payload.to_outbound();

        tracing::info!(
            dispatch_id = %dispatch_id,
            count = identifiers.len(),
            scope = %self.scope,
            "Starting dispatch"
        );

        'identifiers: for (index, raw) in identifiers.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                summary.not_attempted = identifiers[index..].to_vec();
                break;
            }

            let to = match CanonicalIdentifier::try_from_canonical(raw) {
                Ok(to) => to,
                Err(e) => {
                    tracing::warn!(
                        dispatch_id = %dispatch_id,
                        identifier = %raw,
                        "Skipping malformed identifier"
                    );
                    let outcome = DispatchOutcome::failed(
                        raw.clone(),
                        DispatchErrorKind::InvalidFormat,
                        e.to_string(),
                    );
                    self.record(&mut summary, outcome);
                    continue;
                }
            };

            for gate in &self.gates {
                if !gate.acquire(&self.scope, cancel).await {
                    tracing::info!(
                        dispatch_id = %dispatch_id,
                        gate = gate.name(),
                        "Dispatch cancelled while waiting on rate gate"
                    );
                    summary.cancelled = true;
                    summary.not_attempted = identifiers[index..].to_vec();
                    break 'identifiers;
                }
            }

            let outcome = self.send_one(dispatch_id, &to, &outbound).await;
            self.record(&mut summary, outcome);
        }

        if summary.cancelled {
            tracing::info!(
                dispatch_id = %dispatch_id,
                sent = summary.total_sent,
                failed = summary.total_failed,
                not_attempted = summary.not_attempted.len(),
                "Dispatch cancelled"
            );
        } else {
            tracing::info!(
                dispatch_id = %dispatch_id,
                sent = summary.total_sent,
                failed = summary.total_failed,
                "Dispatch finished"
            );
        }

        summary
    }

    async fn send_one(
        &self,
        dispatch_id: DispatchId,
        to: &CanonicalIdentifier,
        outbound: &OutboundMessage,
    ) -> DispatchOutcome {
        let send = self.transport.send(self.transport.sender(), to, outbound);
        match tokio::time::timeout(self.send_timeout, send).await {
            Ok(Ok(external_message_id)) => {
                tracing::debug!(
                    dispatch_id = %dispatch_id,
                    to = %to,
                    external_message_id = %external_message_id,
                    "Message sent"
                );
                DispatchOutcome::sent(to.as_str(), external_message_id)
            }
            Ok(Err(e)) => {
                let kind = if e.is_outside_window() {
                    DispatchErrorKind::OutsideMessagingWindow
                } else {
                    DispatchErrorKind::Unknown
                };
                tracing::warn!(
                    dispatch_id = %dispatch_id,
                    to = %to,
                    error_kind = kind.as_label(),
                    provider_code = e.code(),
                    error = %e,
                    "Send failed"
                );
                DispatchOutcome::failed(to.as_str(), kind, e.to_string())
                    .with_provider_code(e.code())
            }
            Err(_) => {
                tracing::warn!(
                    dispatch_id = %dispatch_id,
                    to = %to,
                    timeout_ms = self.send_timeout.as_millis() as u64,
                    "Send timed out"
                );
                DispatchOutcome::failed(
                    to.as_str(),
                    DispatchErrorKind::Timeout,
                    format!("Send timed out after {}ms", self.send_timeout.as_millis()),
                )
            }
        }
    }

    fn record(&self, summary: &mut BulkDispatchSummary, outcome: DispatchOutcome) {
        let label = match outcome.error_kind {
            None => "sent",
            Some(kind) => kind.as_label(),
        };
        counter!("volley_messages_total", "outcome" => label).increment(1);
        summary.push(outcome);
    }
}
