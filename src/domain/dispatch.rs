//! Dispatch payloads and per-recipient outcome accounting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one bulk dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DispatchId(pub Uuid);

impl DispatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DispatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for DispatchId {
    fn from(uuid: Uuid) -> Self {
        DispatchId(uuid)
    }
}

impl std::ops::Deref for DispatchId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for DispatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// What to send to every recipient of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Free text; only deliverable inside the provider's freeform window.
    Freeform { body: String },
    /// A pre-approved provider template.
    Template {
        /// Provider-side template reference (e.g. a content SID)
        template_ref: String,
        language: Option<String>,
        /// Positional variables; `variables[i]` fills placeholder `i + 1`
        #[serde(default)]
        variables: Vec<String>,
    },
}

impl MessagePayload {
    pub fn freeform(body: impl Into<String>) -> Self {
        MessagePayload::Freeform { body: body.into() }
    }

    pub fn template(template_ref: impl Into<String>, variables: Vec<String>) -> Self {
        MessagePayload::Template {
            template_ref: template_ref.into(),
            language: None,
            variables,
        }
    }

    pub fn is_template(&self) -> bool {
        matches!(self, MessagePayload::Template { .. })
    }

    /// Build what actually goes on the wire.
    pub fn to_outbound(&self) -> OutboundMessage {
        match self {
            MessagePayload::Freeform { body } => OutboundMessage::Body(body.clone()),
            MessagePayload::Template {
                template_ref,
                variables,
                ..
            } => OutboundMessage::Template {
                template_ref: template_ref.clone(),
                variables: index_variables(variables),
            },
        }
    }
}

/// Bind positional variables to 1-based placeholder indexes.
pub fn index_variables(variables: &[String]) -> BTreeMap<usize, String> {
    variables
        .iter()
        .enumerate()
        .map(|(i, value)| (i + 1, value.clone()))
        .collect()
}

/// Payload as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OutboundMessage {
    Body(String),
    Template {
        template_ref: String,
        /// Placeholder index (1-based) to value
        variables: BTreeMap<usize, String>,
    },
}

/// Why a single send failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchErrorKind {
    /// The identifier failed re-validation; nothing was sent
    InvalidFormat,
    /// Recipient is outside the freeform window; retry with a template
    OutsideMessagingWindow,
    /// The send did not finish within the configured timeout
    Timeout,
    /// Any other transport failure
    Unknown,
}

impl DispatchErrorKind {
    /// Low-cardinality label for metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            DispatchErrorKind::InvalidFormat => "invalid_format",
            DispatchErrorKind::OutsideMessagingWindow => "outside_window",
            DispatchErrorKind::Timeout => "timeout",
            DispatchErrorKind::Unknown => "unknown",
        }
    }
}

/// Result of attempting one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub identifier: String,
    pub success: bool,
    pub external_message_id: Option<String>,
    pub error_kind: Option<DispatchErrorKind>,
    pub error_message: Option<String>,
    /// Provider error code, when the provider returned one
    pub provider_code: Option<i64>,
}

impl DispatchOutcome {
    pub fn sent(identifier: impl Into<String>, external_message_id: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            success: true,
            external_message_id: Some(external_message_id.into()),
            error_kind: None,
            error_message: None,
            provider_code: None,
        }
    }

    pub fn failed(
        identifier: impl Into<String>,
        kind: DispatchErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            success: false,
            external_message_id: None,
            error_kind: Some(kind),
            error_message: Some(message.into()),
            provider_code: None,
        }
    }

    pub fn with_provider_code(mut self, code: Option<i64>) -> Self {
        self.provider_code = code;
        self
    }
}

/// Aggregate result of one bulk dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkDispatchSummary {
    pub dispatch_id: DispatchId,
    pub total_sent: usize,
    pub total_failed: usize,
    /// One entry per attempted identifier, in input order
    pub outcomes: Vec<DispatchOutcome>,
    /// True when the dispatch stopped early on cancellation
    pub cancelled: bool,
    /// Identifiers never attempted because of cancellation, in input order
    pub not_attempted: Vec<String>,
}

impl BulkDispatchSummary {
    pub fn new(dispatch_id: DispatchId) -> Self {
        Self {
            dispatch_id,
            total_sent: 0,
            total_failed: 0,
            outcomes: Vec::new(),
            cancelled: false,
            not_attempted: Vec::new(),
        }
    }

    /// Append an outcome, keeping the counters in step with the list.
    pub fn push(&mut self, outcome: DispatchOutcome) {
        if outcome.success {
            self.total_sent += 1;
        } else {
            self.total_failed += 1;
        }
        self.outcomes.push(outcome);
    }

    pub fn successes(&self) -> impl Iterator<Item = &DispatchOutcome> {
        self.outcomes.iter().filter(|o| o.success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &DispatchOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }

    /// Recipients that should be retried with a template.
    pub fn outside_window(&self) -> impl Iterator<Item = &DispatchOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.error_kind == Some(DispatchErrorKind::OutsideMessagingWindow))
    }
}
