//! Message transport contract and its REST implementation.

use serde::{Deserialize, Serialize};

pub mod twilio;

pub use twilio::TwilioTransport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub id: String,
    pub sender: String,
    pub body: String,
    pub received_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("missing required env var `{0}`")]
    MissingEnvVar(String),
    #[error("transport request failed: {0}")]
    Request(String),
    #[error("transport returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode transport response: {0}")]
    Decode(String),
}

pub trait Transport: Send + Sync {
    /// Inbound events received strictly after `since_ms`, oldest first.
    fn fetch_inbound(&self, since_ms: i64) -> Result<Vec<InboundEvent>, TransportError>;

    /// Sends one message and returns the provider's message id.
    fn send(&self, to: &str, body: &str, media_url: Option<&str>)
        -> Result<String, TransportError>;

    fn max_message_len(&self) -> usize;
}

/// Sends `body` split into transport-sized chunks, stopping at the first failure.
pub fn send_chunked(
    transport: &dyn Transport,
    to: &str,
    body: &str,
) -> Result<usize, TransportError> {
    let chunks = chunk_message(body, transport.max_message_len());
    for chunk in &chunks {
        transport.send(to, chunk, None)?;
    }
    Ok(chunks.len())
}

/// Splits `text` into pieces of at most `limit` characters, preferring line
/// boundaries and hard-splitting lines that are longer than `limit`.
pub fn chunk_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len <= limit {
            current.push_str(line);
            current_len += line_len;
            continue;
        }
        for ch in line.chars() {
            if current_len >= limit {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            current.push(ch);
            current_len += 1;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
        .into_iter()
        .map(|chunk| chunk.trim_end_matches('\n').to_string())
        .filter(|chunk| !chunk.is_empty())
        .collect()
}
