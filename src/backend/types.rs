use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Server-side scope limiting which push events a connection receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Execution(String),
    Content(String),
    Workflow(String),
}

impl Room {
    /// Wire identifier, e.g. `execution:abc`.
    pub fn id(&self) -> String {
        match self {
            Self::Execution(id) => format!("execution:{}", id),
            Self::Content(id) => format!("content:{}", id),
            Self::Workflow(id) => format!("workflow:{}", id),
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Frames written to the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Join(Room),
    Leave(Room),
}

impl OutboundFrame {
    pub fn to_json(&self) -> serde_json::Value {
        let (event, room) = match self {
            Self::Join(room) => ("join", room),
            Self::Leave(room) => ("leave", room),
        };
        serde_json::json!({ "event": event, "room": room.id() })
    }
}

/// What an open push channel delivers to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Event { name: String, data: serde_json::Value },
    /// The link is gone. `None` for a clean close we asked for.
    Closed(Option<String>),
}

/// Both directions of an open push channel.
pub struct PushLink {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::Receiver<InboundFrame>,
}

/// Wrapper for push channel text frames
#[derive(Debug, Clone, Deserialize)]
pub struct WsEnvelope {
    #[serde(alias = "type")]
    pub event: String,
    #[serde(default, alias = "payload")]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerRequest<'a> {
    pub payload: &'a serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    #[serde(alias = "run_id")]
    pub run_id: String,
    pub id: i64,
}
