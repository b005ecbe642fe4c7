//! Scriptable transport for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{Transport, TransportError};
use crate::domain::dispatch::OutboundMessage;
use crate::domain::recipient::CanonicalIdentifier;
use crate::error::Result;

type SendResult = std::result::Result<String, TransportError>;

/// Mock transport for testing.
///
/// Responses are queued per recipient and returned in FIFO order. A recipient
/// with nothing queued is accepted with a generated message id (`SM00000001`,
/// `SM00000002`, ...), so tests only script the sends they care about.
///
/// # Example
/// ```ignore
/// let mock = MockTransport::new();
/// mock.add_response(
///     "+15551234567",
///     Err(TransportError::provider(OUTSIDE_WINDOW_ERROR_CODE, "outside window")),
/// );
/// ```
#[derive(Clone)]
pub struct MockTransport {
    responses: Arc<Mutex<HashMap<String, VecDeque<MockResponse>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
    generated: Arc<AtomicUsize>,
    credentials_valid: Arc<AtomicBool>,
    sender: String,
}

enum MockResponse {
    Immediate(SendResult),
    /// Sleeps on the tokio clock before answering, so paused-time tests can
    /// drive send timeouts
    Delayed {
        response: SendResult,
        delay: Duration,
    },
    /// Waits for the trigger (sent or dropped) before answering
    Triggered {
        response: SendResult,
        trigger: oneshot::Receiver<()>,
    },
}

/// Record of a send made through the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub from: String,
    pub to: CanonicalIdentifier,
    pub message: OutboundMessage,
}

impl MockTransport {
    /// Sender number used unless [`with_sender`](Self::with_sender) overrides it.
    pub const DEFAULT_SENDER: &'static str = "+14155238886";

    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            generated: Arc::new(AtomicUsize::new(0)),
            credentials_valid: Arc::new(AtomicBool::new(true)),
            sender: Self::DEFAULT_SENDER.to_string(),
        }
    }

    /// Report `sender` as this transport's sender number. Not validated here.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    /// Queue a response for sends to `to` (canonical form).
    pub fn add_response(&self, to: &str, response: SendResult) {
        self.push(to, MockResponse::Immediate(response));
    }

    /// Queue a response that is only returned after `delay` has elapsed.
    pub fn add_response_with_delay(&self, to: &str, response: SendResult, delay: Duration) {
        self.push(to, MockResponse::Delayed { response, delay });
    }

    /// Queue a response that blocks until the returned sender fires or is dropped.
    pub fn add_response_with_trigger(
        &self,
        to: &str,
        response: SendResult,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.push(
            to,
            MockResponse::Triggered {
                response,
                trigger: rx,
            },
        );
        tx
    }

    pub fn set_credentials_valid(&self, valid: bool) {
        self.credentials_valid.store(valid, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Recipients in the order they were sent to.
    pub fn sent_to(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|call| call.to.to_string())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Sends currently waiting on a delayed or triggered response.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn push(&self, to: &str, response: MockResponse) {
        self.responses
            .lock()
            .entry(to.to_string())
            .or_default()
            .push_back(response);
    }

    fn next_generated_sid(&self) -> String {
        let n = self.generated.fetch_add(1, Ordering::SeqCst) + 1;
        format!("SM{n:08}")
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        from: &str,
        to: &CanonicalIdentifier,
        message: &OutboundMessage,
    ) -> SendResult {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
        };

        self.calls.lock().push(MockCall {
            from: from.to_string(),
            to: to.clone(),
            message: message.clone(),
        });

        let queued = self
            .responses
            .lock()
            .get_mut(to.as_str())
            .and_then(VecDeque::pop_front);

        match queued {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Delayed { response, delay }) => {
                tokio::time::sleep(delay).await;
                response
            }
            Some(MockResponse::Triggered { response, trigger }) => {
                let _ = trigger.await;
                response
            }
            None => Ok(self.next_generated_sid()),
        }
    }

    fn sender(&self) -> &str {
        &self.sender
    }

    async fn validate_credentials(&self) -> Result<bool> {
        Ok(self.credentials_valid.load(Ordering::SeqCst))
    }
}

/// Decrements the in-flight counter even when the send future is dropped.
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
