use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tmuxdeck_terminal::Status;

/// One unit of process output with its per-session sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub seq: u64,
    pub data: Bytes,
}

impl Chunk {
    pub fn new(seq: u64, data: impl Into<Bytes>) -> Self {
        Self {
            seq,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    Output {
        seq: u64,
        #[serde(serialize_with = "bytes_as_text", deserialize_with = "text_as_bytes")]
        data: Bytes,
    },
    Status {
        status: Status,
        timestamp: DateTime<Utc>,
    },
    Exit {
        code: Option<i32>,
    },
    /// The session was replaced by a new `start`; this subscriber is detached.
    Restarted,
}

impl From<&Chunk> for SessionEvent {
    fn from(chunk: &Chunk) -> Self {
        SessionEvent::Output {
            seq: chunk.seq,
            data: chunk.data.clone(),
        }
    }
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Output { .. } => "output",
            SessionEvent::Status { .. } => "status",
            SessionEvent::Exit { .. } => "exit",
            SessionEvent::Restarted => "restarted",
        }
    }
}

// Output chunks are cut on UTF-8 boundaries by the reader, so lossy conversion only
// touches genuinely invalid bytes.
fn bytes_as_text<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(data))
}

fn text_as_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
    let text = String::deserialize(deserializer)?;
    Ok(Bytes::from(text))
}

/// Registry-wide status side channel (UI badges, notifier).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub session_id: String,
    pub display_name: String,
    pub previous: Status,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
}
