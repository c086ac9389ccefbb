use async_trait::async_trait;

use crate::error::TransportError;

const UNKNOWN_FAILURE: &str = "unknown failure";

/// A message as fetched from the input topic.
///
/// The annotation is only set on messages headed for the dead-letter topic,
/// and carries the human-readable reason they were refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
    annotation: Option<String>,
}

impl RawMessage {
    pub fn new(topic: &str, partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.to_owned(),
            partition,
            offset,
            payload,
            annotation: None,
        }
    }

    pub fn annotate(&mut self, annotation: impl Into<String>) {
        self.annotation = Some(annotation.into());
    }

    pub fn annotation(&self) -> Option<&str> {
        self.annotation.as_deref()
    }

    /// Original payload, a newline, then the annotation.
    pub fn dead_letter_payload(&self) -> Vec<u8> {
        let annotation = self.annotation().unwrap_or(UNKNOWN_FAILURE);
        let mut payload = Vec::with_capacity(self.payload.len() + annotation.len() + 1);
        payload.extend_from_slice(&self.payload);
        payload.push(b'\n');
        payload.extend_from_slice(annotation.as_bytes());
        payload
    }
}

/// Broker primitives the ingestion pipeline is built on.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Wait for the next message. Returns `TransportError::Closed` once the
    /// source will not produce anything else.
    async fn fetch(&self) -> Result<RawMessage, TransportError>;

    /// Produce the message, annotation appended, to the dead-letter topic.
    async fn write_dead_letter(&self, message: &RawMessage) -> Result<(), TransportError>;

    /// Acknowledge that the message reached its terminal state. Called once
    /// per delivery; a redelivered message is acknowledged once per copy.
    async fn commit(&self, message: &RawMessage) -> Result<(), TransportError>;

    /// Wait until every acknowledgement so far is durable. Called once, after
    /// the last `commit`.
    async fn flush(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_payload_appends_annotation() {
        let mut message = RawMessage::new("FIO", 0, 7, br#"{"name":""}"#.to_vec());
        message.annotate("name required");

        assert_eq!(
            message.dead_letter_payload(),
            b"{\"name\":\"\"}\nname required".to_vec()
        );
    }

    #[test]
    fn dead_letter_payload_without_annotation() {
        let message = RawMessage::new("FIO", 0, 7, b"x".to_vec());
        assert_eq!(message.dead_letter_payload(), b"x\nunknown failure".to_vec());
    }
}
