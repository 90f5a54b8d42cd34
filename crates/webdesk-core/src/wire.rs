use crate::{FsNode, VirtualProcess};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const MAX_FRAME_BYTES: usize = 256 * 1024;

pub const TOPIC_METRICS_HOST: &str = "metrics.host";
pub const TOPIC_VPROC_EVENTS: &str = "vproc.events";
pub const TOPIC_FS_EVENTS: &str = "fs.events";
pub const ALL_TOPICS: [&str; 3] = [TOPIC_METRICS_HOST, TOPIC_VPROC_EVENTS, TOPIC_FS_EVENTS];

/// WebSocket close code used when the bearer token is missing or rejected.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

pub fn is_known_topic(topic: &str) -> bool {
    ALL_TOPICS.contains(&topic)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
    Ping,
}

/// Client -> server control frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientFrame {
    pub action: ControlAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl ClientFrame {
    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self {
            action: ControlAction::Subscribe,
            topic: Some(topic.into()),
        }
    }

    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self {
            action: ControlAction::Unsubscribe,
            topic: Some(topic.into()),
        }
    }

    pub fn ping() -> Self {
        Self {
            action: ControlAction::Ping,
            topic: None,
        }
    }
}

/// Server -> client frame. Control acks carry `type`; data frames carry `topic`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServerFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Data { topic: String, data: Value },
    Ack(ControlAck),
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAck {
    Subscribed(Option<String>),
    Unsubscribed(Option<String>),
    Pong,
}

impl ServerFrame {
    pub fn data(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: Some(topic.into()),
            kind: None,
            data: Some(data),
        }
    }

    pub fn ack(ack: &ControlAck) -> Self {
        let (kind, topic) = match ack {
            ControlAck::Subscribed(topic) => ("subscribed", topic.clone()),
            ControlAck::Unsubscribed(topic) => ("unsubscribed", topic.clone()),
            ControlAck::Pong => ("pong", None),
        };
        Self {
            topic,
            kind: Some(kind.to_string()),
            data: None,
        }
    }

    /// Acks are checked before topics: a `subscribed` ack also names its topic
    /// but must never reach topic handlers.
    pub fn classify(self) -> Inbound {
        match self.kind.as_deref() {
            Some("subscribed") => return Inbound::Ack(ControlAck::Subscribed(self.topic)),
            Some("unsubscribed") => return Inbound::Ack(ControlAck::Unsubscribed(self.topic)),
            Some("pong") => return Inbound::Ack(ControlAck::Pong),
            _ => {}
        }
        match self.topic {
            Some(topic) => Inbound::Data {
                topic,
                data: self.data.unwrap_or(Value::Null),
            },
            None => Inbound::Ignored,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum VprocEvent {
    Started {
        process: VirtualProcess,
    },
    Stopped {
        process: VirtualProcess,
    },
    Deleted {
        id: String,
        #[serde(default)]
        window_id: Option<String>,
    },
    Cleared,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FsEvent {
    Created { node: FsNode },
    Updated { node: FsNode },
    Deleted { id: String },
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

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    raw: &str,
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Decodes a topic payload into its typed form.
pub fn decode_payload<T: DeserializeOwned>(data: &Value) -> Result<T, FrameError> {
    T::deserialize(data).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_frames_match_wire_shape() {
        let sub = encode_frame(&ClientFrame::subscribe(TOPIC_METRICS_HOST), MAX_FRAME_BYTES)
            .expect("encode");
        assert_eq!(sub, r#"{"action":"subscribe","topic":"metrics.host"}"#);
        let ping = encode_frame(&ClientFrame::ping(), MAX_FRAME_BYTES).expect("encode");
        assert_eq!(ping, r#"{"action":"ping"}"#);
    }

    #[test]
    fn acks_are_not_data_even_with_topic() {
        let frame: ServerFrame =
            decode_frame(r#"{"type":"subscribed","topic":"metrics.host"}"#, MAX_FRAME_BYTES)
                .expect("decode");
        assert_eq!(
            frame.classify(),
            Inbound::Ack(ControlAck::Subscribed(Some("metrics.host".to_string())))
        );

        let pong: ServerFrame =
            decode_frame(r#"{"type":"pong"}"#, MAX_FRAME_BYTES).expect("decode");
        assert_eq!(pong.classify(), Inbound::Ack(ControlAck::Pong));
    }

    #[test]
    fn topic_frames_are_data() {
        let frame: ServerFrame = decode_frame(
            r#"{"topic":"vproc.events","data":{"event":"cleared"}}"#,
            MAX_FRAME_BYTES,
        )
        .expect("decode");
        let Inbound::Data { topic, data } = frame.classify() else {
            panic!("expected data frame")
        };
        assert_eq!(topic, TOPIC_VPROC_EVENTS);
        let event: VprocEvent = decode_payload(&data).expect("payload");
        assert_eq!(event, VprocEvent::Cleared);
    }

    #[test]
    fn frames_without_topic_or_ack_are_ignored() {
        let frame: ServerFrame =
            decode_frame(r#"{"type":"welcome","data":1}"#, MAX_FRAME_BYTES).expect("decode");
        assert_eq!(frame.classify(), Inbound::Ignored);
    }

    #[test]
    fn ack_builder_round_trips_through_classify() {
        let ack = ControlAck::Unsubscribed(Some(TOPIC_FS_EVENTS.to_string()));
        assert_eq!(ServerFrame::ack(&ack).classify(), Inbound::Ack(ack));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let huge = ServerFrame::data(TOPIC_FS_EVENTS, json!({"blob": "x".repeat(256)}));
        assert!(matches!(
            encode_frame(&huge, 64),
            Err(FrameError::OversizedFrame { max: 64, .. })
        ));
        let raw = "y".repeat(100);
        assert!(matches!(
            decode_frame::<ServerFrame>(&raw, 10),
            Err(FrameError::OversizedFrame { size: 100, max: 10 })
        ));
        assert!(matches!(
            decode_frame::<ServerFrame>("{not json", MAX_FRAME_BYTES),
            Err(FrameError::Decode(_))
        ));
    }

    #[test]
    fn deleted_event_window_id_is_optional() {
        let event: VprocEvent =
            serde_json::from_value(json!({"event": "deleted", "id": "p1"})).expect("parse");
        assert_eq!(
            event,
            VprocEvent::Deleted {
                id: "p1".to_string(),
                window_id: None
            }
        );
        assert!(is_known_topic("fs.events"));
        assert!(!is_known_topic("chat"));
    }
}
