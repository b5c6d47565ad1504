use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

use crate::message::Message;

/// Integer discriminant describing what kind of analytics event this is.
///
/// Unknown values are kept as-is so newer clients can send kinds this
/// build does not know about yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(pub i32);

impl EventType {
    pub const NONE: EventType = EventType(1);
    pub const USER: EventType = EventType(2);
}

impl Default for EventType {
    fn default() -> Self {
        Self::NONE
    }
}

/// Analytics event carried from the receiver, through the queue, to storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    id: Uuid,
    /// Creation time in epoch milliseconds.
    timestamp: i64,
    #[serde(rename = "type")]
    event_type: EventType,
    identifier: String,
    #[serde(default)]
    user_id: Option<String>,
    data: Box<RawValue>,
}

impl Event {
    /// Creates a new event, assigning a fresh id and the current timestamp.
    pub fn new(
        event_type: EventType,
        identifier: impl Into<String>,
        user_id: Option<String>,
        data: Box<RawValue>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now().timestamp_millis(),
            event_type,
            identifier: identifier.into(),
            user_id,
            data,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Raw JSON payload, exactly as received.
    pub fn data(&self) -> &RawValue {
        &self.data
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

// RawValue has no PartialEq; compare the payload text instead.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.timestamp == other.timestamp
            && self.event_type == other.event_type
            && self.identifier == other.identifier
            && self.user_id == other.user_id
            && self.data.get() == other.data.get()
    }
}

impl Eq for Event {}

impl Message for Event {
    const TYPE_TAG: &'static str = "event";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: &str) -> Box<RawValue> {
        RawValue::from_string(json.to_string()).unwrap()
    }

    #[test]
    fn new_assigns_unique_ids() {
        let a = Event::new(EventType::USER, "app", None, raw("{}"));
        let b = Event::new(EventType::USER, "app", None, raw("{}"));
        assert_ne!(a.id(), b.id());
        assert!(a.timestamp() > 0);
    }

    #[test]
    fn json_uses_wire_field_names() {
        let event = Event::new(
            EventType::USER,
            "checkout",
            Some("user-7".into()),
            raw(r#"{"cart":[1,2]}"#),
        );
        let value: serde_json::Value = serde_json::from_slice(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], 2);
        assert_eq!(value["identifier"], "checkout");
        assert_eq!(value["user_id"], "user-7");
        assert_eq!(value["data"]["cart"][1], 2);
        assert_eq!(value["id"], event.id().to_string());
    }

    #[test]
    fn payload_is_kept_verbatim() {
        let event = Event::new(EventType::NONE, "app", None, raw(r#"{"b":1,"a":[true, null]}"#));
        let decoded = Event::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(decoded.data().get(), r#"{"b":1,"a":[true, null]}"#);
        assert_eq!(decoded, event);
    }

    #[test]
    fn missing_user_id_decodes_as_none() {
        let body = br#"{"id":"67e55044-10b1-426f-9247-bb680e5fe0c8","timestamp":1,"type":9,"identifier":"x","data":7}"#;
        let event = Event::from_json(body).unwrap();
        assert_eq!(event.user_id(), None);
        assert_eq!(event.event_type(), EventType(9));
    }

    #[test]
    fn type_tag_is_declared() {
        assert_eq!(<Event as Message>::TYPE_TAG, "event");
    }
}
