//! Duplicate-aware, rate-gated bulk message dispatch.
//!
//! A batch of raw recipient identifiers is normalized and classified against
//! recipient history (invalid / already contacted / new), then a single
//! payload is sent to each recipient in order through a pair of sliding-window
//! rate gates. Each send is bounded by a timeout and a failure never stops the
//! batch. Successful sends are written back to history by a detached worker.
//!
//! The transport and the recipient store sit behind traits, with an
//! HTTP-backed transport, an in-memory store and (behind the `postgres`
//! feature) a PostgreSQL store provided.

pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod history;
pub mod rate_gate;
pub mod sender;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use classifier::classify;
pub use config::PipelineConfig;
pub use dispatcher::{DEFAULT_SCOPE, DEFAULT_SEND_TIMEOUT, Dispatcher};
pub use domain::classification::{ClassificationResult, ValidationOutcome};
pub use domain::dispatch::{
    BulkDispatchSummary, DispatchErrorKind, DispatchId, DispatchOutcome, MessagePayload,
    OutboundMessage,
};
pub use domain::recipient::{CanonicalIdentifier, FormatError, is_format_valid, normalize};
pub use error::{Result, VolleyError};
pub use history::{HistoryEntry, HistoryRecorder};
pub use rate_gate::{RateDecision, RateGate};
pub use sender::{BulkSender, SendRequest};
#[cfg(feature = "postgres")]
pub use store::PostgresRecipientStore;
pub use store::{
    InMemoryRecipientStore, RecipientRecord, RecipientStore, TemplateSendRecord, metadata_object,
};
pub use transport::{
    MockTransport, OUTSIDE_WINDOW_ERROR_CODE, ReqwestTransport, Transport, TransportConfig,
    TransportError, TransportErrorKind,
};
