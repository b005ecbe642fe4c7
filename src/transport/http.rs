//! Production transport over reqwest.

use async_trait::async_trait;
use serde::Deserialize;

use super::{Transport, TransportConfig, TransportError};
use crate::domain::dispatch::OutboundMessage;
use crate::domain::recipient::CanonicalIdentifier;
use crate::error::Result;

/// Twilio-style messaging API client.
///
/// Posts form-encoded messages to `{base_url}/2010-04-01/Accounts/{sid}/Messages.json`
/// with basic auth, prefixing both addresses with the configured channel
/// (`whatsapp:` by default).
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

/// Successful message creation response (only the fields we read).
#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: String,
}

/// Error body returned by the provider on non-2xx responses.
#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    code: Option<i64>,
    message: Option<String>,
}

impl ReqwestTransport {
    /// Create a transport, failing with a configuration error if credentials are missing.
    pub fn new(config: TransportConfig) -> Result<Self> {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.base_url, self.config.account_sid
        )
    }

    fn account_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}.json",
            self.config.base_url, self.config.account_sid
        )
    }

    fn address(&self, number: &str) -> String {
        format!("{}{}", self.config.channel_prefix, number)
    }

    fn form_fields(
        &self,
        from: &str,
        to: &CanonicalIdentifier,
        message: &OutboundMessage,
    ) -> std::result::Result<Vec<(&'static str, String)>, TransportError> {
        let mut fields = vec![("From", self.address(from)), ("To", self.address(to))];
        match message {
            OutboundMessage::Body(body) => fields.push(("Body", body.clone())),
            OutboundMessage::Template {
                template_ref,
                variables,
            } => {
                fields.push(("ContentSid", template_ref.clone()));
                if !variables.is_empty() {
                    let encoded = serde_json::to_string(variables).map_err(|e| {
                        TransportError::other(format!("Failed to encode template variables: {e}"))
                    })?;
                    fields.push(("ContentVariables", encoded));
                }
            }
        }
        Ok(fields)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[tracing::instrument(skip(self, message), fields(to = %to))]
    async fn send(
        &self,
        from: &str,
        to: &CanonicalIdentifier,
        message: &OutboundMessage,
    ) -> std::result::Result<String, TransportError> {
        let fields = self.form_fields(from, to, message)?;

        tracing::debug!(url = %self.messages_url(), "Sending message");

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&fields)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Message request failed");
                TransportError::from(e)
            })?;

        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            let resource: MessageResource = serde_json::from_str(&body).map_err(|e| {
                TransportError::other(format!("Unparseable provider response: {e}"))
            })?;
            tracing::debug!(status = status.as_u16(), sid = %resource.sid, "Message accepted");
            return Ok(resource.sid);
        }

        tracing::warn!(status = status.as_u16(), body_len = body.len(), "Message rejected");

        match serde_json::from_str::<ProviderErrorBody>(&body) {
            Ok(ProviderErrorBody {
                code: Some(code),
                message,
            }) => Err(TransportError::Provider {
                code,
                message: message.unwrap_or_else(|| body.clone()),
                status: Some(status.as_u16()),
            }),
            _ => Err(TransportError::other(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            ))),
        }
    }

    fn sender(&self) -> &str {
        &self.config.from_number
    }

    #[tracing::instrument(skip(self))]
    async fn validate_credentials(&self) -> Result<bool> {
        let response = self
            .client
            .get(self.account_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .send()
            .await?;

        let valid = response.status().is_success();
        if !valid {
            tracing::warn!(
                status = response.status().as_u16(),
                "Transport credentials were rejected"
            );
        }
        Ok(valid)
    }
}
