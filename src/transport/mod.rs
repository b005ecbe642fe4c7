//! Message transport abstraction.
//!
//! This module defines the [`Transport`] trait the dispatcher sends through,
//! enabling testability with mock implementations. A production implementation
//! talks to a Twilio-style messaging REST API over reqwest.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::dispatch::OutboundMessage;
use crate::domain::recipient::CanonicalIdentifier;
use crate::error::{Result, VolleyError};

mod http;
mod mock;

pub use http::ReqwestTransport;
pub use mock::{MockCall, MockTransport};

/// Provider error code for "recipient is outside the permitted freeform window".
pub const OUTSIDE_WINDOW_ERROR_CODE: i64 = 63016;

/// Broad classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Freeform message refused because the recipient's session window is closed
    OutsideMessagingWindow,
    /// Provider answered with an error code
    ProviderRejected,
    /// Network failure, malformed response, or anything else
    Unknown,
}

/// A failed send, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The provider rejected the request with a provider-defined code
    #[error("Provider rejected message (code {code}): {message}")]
    Provider {
        code: i64,
        message: String,
        status: Option<u16>,
    },
    /// The request never produced a provider verdict
    #[error("Transport failure: {0}")]
    Other(String),
}

impl TransportError {
    pub fn provider(code: i64, message: impl Into<String>) -> Self {
        TransportError::Provider {
            code,
            message: message.into(),
            status: None,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        TransportError::Other(message.into())
    }

    pub fn code(&self) -> Option<i64> {
        match self {
            TransportError::Provider { code, .. } => Some(*code),
            TransportError::Other(_) => None,
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        match self {
            TransportError::Provider { code, .. } if *code == OUTSIDE_WINDOW_ERROR_CODE => {
                TransportErrorKind::OutsideMessagingWindow
            }
            TransportError::Provider { .. } => TransportErrorKind::ProviderRejected,
            TransportError::Other(_) => TransportErrorKind::Unknown,
        }
    }

    pub fn is_outside_window(&self) -> bool {
        self.kind() == TransportErrorKind::OutsideMessagingWindow
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Other(e.to_string())
    }
}

/// Trait for sending one message to one recipient.
///
/// # Example
/// ```ignore
/// let transport = ReqwestTransport::new(TransportConfig::from_env()?)?;
/// let sid = transport
///     .send(transport.sender(), &recipient, &OutboundMessage::Body("hi".into()))
///     .await?;
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `message` from `from` to `to`, returning the provider's message id.
    async fn send(
        &self,
        from: &str,
        to: &CanonicalIdentifier,
        message: &OutboundMessage,
    ) -> std::result::Result<String, TransportError>;

    /// Canonical sender number every message goes out from.
    fn sender(&self) -> &str;

    /// Check that the configured credentials are accepted by the provider.
    ///
    /// Used at startup and by health checks, never per send.
    async fn validate_credentials(&self) -> Result<bool>;
}

/// Credentials and addressing for the production transport.
#[derive(Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub account_sid: String,
    pub auth_token: String,
    /// Sender number in canonical form; the only source of the `From` address
    pub from_number: String,
    /// API base URL, without trailing slash
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Channel prefix put in front of both addresses (`"whatsapp:"`)
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
}

fn default_base_url() -> String {
    "https://api.twilio.com".to_string()
}

fn default_channel_prefix() -> String {
    "whatsapp:".to_string()
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"<redacted>")
            .field("from_number", &self.from_number)
            .field("base_url", &self.base_url)
            .field("channel_prefix", &self.channel_prefix)
            .finish()
    }
}

impl TransportConfig {
    pub fn new(
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        from_number: impl Into<String>,
    ) -> Self {
        Self {
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            from_number: from_number.into(),
            base_url: default_base_url(),
            channel_prefix: default_channel_prefix(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Read the config from `TWILIO_ACCOUNT_SID`, `TWILIO_AUTH_TOKEN` and
    /// `TWILIO_WHATSAPP_NUMBER` (optionally `TWILIO_API_BASE_URL`).
    ///
    /// Meant for process startup; business logic receives the resulting value.
    pub fn from_env() -> Result<Self> {
        fn var(name: &str) -> Result<String> {
            std::env::var(name)
                .map_err(|_| VolleyError::Configuration(format!("{name} is not set")))
        }

        let mut config = Self::new(
            var("TWILIO_ACCOUNT_SID")?,
            var("TWILIO_AUTH_TOKEN")?,
            var("TWILIO_WHATSAPP_NUMBER")?,
        );
        if let Ok(base_url) = std::env::var("TWILIO_API_BASE_URL") {
            config.base_url = base_url;
        }
        config.validate()?;
        Ok(config)
    }

    /// Fails with [`VolleyError::Configuration`] on missing credentials or a
    /// sender number that is not already canonical (no normalization is applied).
    pub fn validate(&self) -> Result<()> {
        if self.account_sid.trim().is_empty() {
            return Err(VolleyError::Configuration(
                "transport account SID is missing".to_string(),
            ));
        }
        if self.auth_token.trim().is_empty() {
            return Err(VolleyError::Configuration(
                "transport auth token is missing".to_string(),
            ));
        }
        CanonicalIdentifier::try_from_canonical(&self.from_number).map_err(|e| {
            VolleyError::Configuration(format!("transport sender number is invalid: {e}"))
        })?;
        Ok(())
    }
}
