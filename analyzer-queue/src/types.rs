use std::borrow::Cow;

use analyzer_models::Message;

use crate::QueueError;

const PREVIEW_LIMIT: usize = 256;

/// Unit moved through a backend: routing tag plus serialized payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub type_tag: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(type_tag: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            type_tag: type_tag.into(),
            payload,
        }
    }

    /// Serializes `message` as JSON and tags it with its declared type tag.
    pub fn encode<M: Message>(message: &M) -> Result<Self, QueueError> {
        let payload = serde_json::to_vec(message).map_err(|source| QueueError::Serialize {
            type_tag: M::TYPE_TAG.to_string(),
            source,
        })?;
        Ok(Self::new(M::TYPE_TAG, payload))
    }

    /// Lossy, truncated rendering of the payload for log lines.
    pub fn payload_preview(&self) -> Cow<'_, str> {
        preview(&self.payload)
    }
}

pub(crate) fn preview(payload: &[u8]) -> Cow<'_, str> {
    if payload.len() <= PREVIEW_LIMIT {
        String::from_utf8_lossy(payload)
    } else {
        let head = String::from_utf8_lossy(&payload[..PREVIEW_LIMIT]);
        Cow::Owned(format!("{head}... ({} bytes)", payload.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    impl Message for Ping {
        const TYPE_TAG: &'static str = "ping";
    }

    #[test]
    fn encode_uses_declared_tag() {
        let envelope = Envelope::encode(&Ping { seq: 4 }).unwrap();
        assert_eq!(envelope.type_tag, "ping");
        assert_eq!(envelope.payload, br#"{"seq":4}"#);
    }

    #[test]
    fn preview_truncates_long_payloads() {
        let envelope = Envelope::new("blob", vec![b'a'; 1000]);
        let text = envelope.payload_preview();
        assert!(text.ends_with("... (1000 bytes)"));
        assert!(text.len() < 300);
    }
}
