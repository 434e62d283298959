use super::{InboundEvent, Transport, TransportError};
use crate::config::TransportConfig;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;

const DEFAULT_API_BASE: &str = "https://api.twilio.com";
const PAGE_SIZE: &str = "100";

#[derive(Debug, Clone)]
pub struct TwilioTransport {
    api_base: String,
    account_sid: String,
    auth_token: String,
    from: String,
    max_message_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MessageResource {
    pub(crate) sid: String,
    #[serde(default)]
    pub(crate) from: String,
    #[serde(default)]
    pub(crate) body: Option<String>,
    #[serde(default)]
    pub(crate) direction: String,
    #[serde(default)]
    pub(crate) date_sent: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CreatedMessage {
    sid: String,
}

impl TwilioTransport {
    pub fn new(
        api_base: impl Into<String>,
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        from: impl Into<String>,
        max_message_len: usize,
    ) -> Self {
        Self {
            api_base: api_base.into(),
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            from: from.into(),
            max_message_len,
        }
    }

    /// Builds a client from settings, reading credentials from the configured
    /// environment variables.
    pub fn from_config(config: &TransportConfig) -> Result<Self, TransportError> {
        let account_sid = required_env(&config.account_sid_env)?;
        let auth_token = required_env(&config.auth_token_env)?;
        let api_base = config
            .api_base
            .clone()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Ok(Self::new(
            api_base,
            account_sid,
            auth_token,
            config.from.clone(),
            config.max_message_len,
        ))
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base.trim_end_matches('/'),
            urlencoding::encode(&self.account_sid)
        )
    }

    fn authorization(&self) -> String {
        let raw = format!("{}:{}", self.account_sid, self.auth_token);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }

    pub(crate) fn fetch_query(&self, since_ms: i64) -> Vec<(&'static str, String)> {
        let mut query = vec![("To", self.from.clone()), ("PageSize", PAGE_SIZE.to_string())];
        if let Some(since) = DateTime::<Utc>::from_timestamp_millis(since_ms) {
            if since_ms > 0 {
                query.push(("DateSent>", since.format("%Y-%m-%d").to_string()));
            }
        }
        query
    }
}

fn required_env(key: &str) -> Result<String, TransportError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| TransportError::MissingEnvVar(key.to_string()))
}

fn request_error(error: ureq::Error) -> TransportError {
    match error {
        ureq::Error::Status(status, response) => TransportError::Status {
            status,
            body: response.into_string().unwrap_or_default(),
        },
        other => TransportError::Request(other.to_string()),
    }
}

/// Keeps inbound messages sent strictly after `since_ms`, oldest first.
/// Messages without a parseable send date are skipped.
pub(crate) fn select_inbound(messages: Vec<MessageResource>, since_ms: i64) -> Vec<InboundEvent> {
    let mut events = messages
        .into_iter()
        .filter(|message| message.direction == "inbound")
        .filter_map(|message| {
            let sent = message
                .date_sent
                .as_deref()
                .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())?
                .timestamp_millis();
            (sent > since_ms).then(|| InboundEvent {
                id: message.sid,
                sender: message.from,
                body: message.body.unwrap_or_default(),
                received_at: sent,
            })
        })
        .collect::<Vec<_>>();
    events.sort_by(|a, b| a.received_at.cmp(&b.received_at).then(a.id.cmp(&b.id)));
    events
}

impl Transport for TwilioTransport {
    fn fetch_inbound(&self, since_ms: i64) -> Result<Vec<InboundEvent>, TransportError> {
        let encoded = self
            .fetch_query(since_ms)
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let url = format!("{}?{encoded}", self.messages_url());

        let list = ureq::get(&url)
            .set("Authorization", &self.authorization())
            .call()
            .map_err(request_error)?
            .into_json::<MessageList>()
            .map_err(|e| TransportError::Decode(e.to_string()))?;

        Ok(select_inbound(list.messages, since_ms))
    }

    fn send(
        &self,
        to: &str,
        body: &str,
        media_url: Option<&str>,
    ) -> Result<String, TransportError> {
        let mut form = vec![("To", to), ("From", self.from.as_str()), ("Body", body)];
        if let Some(media_url) = media_url {
            form.push(("MediaUrl", media_url));
        }

        let created = ureq::post(&self.messages_url())
            .set("Authorization", &self.authorization())
            .send_form(&form)
            .map_err(request_error)?
            .into_json::<CreatedMessage>()
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(created.sid)
    }

    fn max_message_len(&self) -> usize {
        self.max_message_len
    }
}
