use crate::{DiscoveredItem, TaskStatusChanged};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_DISCONNECT: &str = "disconnect";
pub const EVENT_TASKS_UPDATED: &str = "tasks_updated";
pub const EVENT_TASK_STATUS_CHANGED: &str = "task_status_changed";
pub const EVENT_NEW_ITEM_DISCOVERED: &str = "new_item_discovered";

/// One text frame on the push channel: `{"event": "...", "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Typed push events. `Connected` and `Disconnected` are synthesized locally
/// by the transport and are never accepted from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    TasksUpdated,
    TaskStatusChanged(TaskStatusChanged),
    NewItemDiscovered(DiscoveredItem),
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Connected => EVENT_CONNECT,
            SyncEvent::Disconnected => EVENT_DISCONNECT,
            SyncEvent::TasksUpdated => EVENT_TASKS_UPDATED,
            SyncEvent::TaskStatusChanged(_) => EVENT_TASK_STATUS_CHANGED,
            SyncEvent::NewItemDiscovered(_) => EVENT_NEW_ITEM_DISCOVERED,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, SyncEvent::Connected | SyncEvent::Disconnected)
    }

    /// Decode a wire frame into a typed event.
    ///
    /// Returns `Ok(None)` for event names this client does not know (and for
    /// the local-only names), so new server events never break old clients.
    pub fn decode(frame: EventFrame) -> Result<Option<SyncEvent>, EventError> {
        let EventFrame { event, data } = frame;
        let decoded = match event.as_str() {
            EVENT_TASKS_UPDATED => SyncEvent::TasksUpdated,
            EVENT_TASK_STATUS_CHANGED => {
                SyncEvent::TaskStatusChanged(decode_payload(&event, data)?)
            }
            EVENT_NEW_ITEM_DISCOVERED => {
                SyncEvent::NewItemDiscovered(decode_payload(&event, data)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }

    pub fn to_frame(&self) -> Result<EventFrame, EventError> {
        let data = match self {
            SyncEvent::Connected | SyncEvent::Disconnected | SyncEvent::TasksUpdated => {
                Value::Null
            }
            SyncEvent::TaskStatusChanged(payload) => encode_payload(self.name(), payload)?,
            SyncEvent::NewItemDiscovered(payload) => encode_payload(self.name(), payload)?,
        };
        Ok(EventFrame::new(self.name(), data))
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    event: &str,
    data: Value,
) -> Result<T, EventError> {
    if data.is_null() {
        return Err(EventError::MissingPayload {
            event: event.to_string(),
        });
    }
    serde_json::from_value(data).map_err(|err| EventError::MalformedPayload {
        event: event.to_string(),
        reason: err.to_string(),
    })
}

fn encode_payload<T: Serialize>(event: &str, payload: &T) -> Result<Value, EventError> {
    serde_json::to_value(payload).map_err(|err| EventError::MalformedPayload {
        event: event.to_string(),
        reason: err.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("event '{event}' is missing its payload")]
    MissingPayload { event: String },
    #[error("event '{event}' has a malformed payload: {reason}")]
    MalformedPayload { event: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame(frame: &EventFrame, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(frame).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame(text: &str, max_frame_bytes: usize) -> Result<EventFrame, FrameError> {
    let raw = text.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_text(text: &str) -> Result<Option<SyncEvent>, EventError> {
        let frame = decode_frame(text, DEFAULT_MAX_FRAME_BYTES).expect("frame");
        SyncEvent::decode(frame)
    }

    #[test]
    fn decodes_known_events() {
        let status = decode_text(r#"{"event":"task_status_changed","data":{"id":5,"is_running":false}}"#)
            .expect("decode")
            .expect("known event");
        assert_eq!(
            status,
            SyncEvent::TaskStatusChanged(TaskStatusChanged {
                id: 5,
                is_running: false
            })
        );

        let updated = decode_text(r#"{"event":"tasks_updated"}"#)
            .expect("decode")
            .expect("known event");
        assert_eq!(updated, SyncEvent::TasksUpdated);

        let item = decode_text(
            r#"{"event":"new_item_discovered","data":{"item_id":"m-1","title":"Ricoh GR III","price":3100,"instant_notify":true,"condition":"like new"}}"#,
        )
        .expect("decode")
        .expect("known event");
        let SyncEvent::NewItemDiscovered(item) = item else {
            panic!("expected discovery event")
        };
        assert_eq!(item.item_id, "m-1");
        assert_eq!(item.price, Some(3100.0));
        assert_eq!(
            item.extra.get("condition"),
            Some(&serde_json::json!("like new"))
        );
    }

    #[test]
    fn unknown_and_local_names_are_ignored() {
        assert_eq!(decode_text(r#"{"event":"price_tick","data":{"x":1}}"#), Ok(None));
        assert_eq!(decode_text(r#"{"event":"connect"}"#), Ok(None));
        assert_eq!(decode_text(r#"{"event":"disconnect"}"#), Ok(None));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let wrong_type = decode_text(r#"{"event":"task_status_changed","data":{"id":5,"is_running":"yes"}}"#);
        assert!(matches!(
            wrong_type,
            Err(EventError::MalformedPayload { ref event, .. }) if event == "task_status_changed"
        ));

        let missing = decode_text(r#"{"event":"task_status_changed"}"#);
        assert!(matches!(missing, Err(EventError::MissingPayload { .. })));
    }

    #[test]
    fn frame_codec_rejects_garbage_and_oversize() {
        assert!(matches!(
            decode_frame("{\"event\":", DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Decode(_))
        ));
        assert!(matches!(
            decode_frame(r#"{"data":{}}"#, DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Decode(_))
        ));

        let huge = EventFrame::new("tasks_updated", serde_json::json!({"blob": "x".repeat(128)}));
        assert!(matches!(
            encode_frame(&huge, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
        let text = encode_frame(&huge, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert!(matches!(
            decode_frame(&text, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn typed_event_survives_the_wire() {
        let event = SyncEvent::TaskStatusChanged(TaskStatusChanged {
            id: 12,
            is_running: true,
        });
        let text = encode_frame(&event.to_frame().expect("frame"), DEFAULT_MAX_FRAME_BYTES)
            .expect("encode");
        assert_eq!(decode_text(&text), Ok(Some(event)));
    }
}
