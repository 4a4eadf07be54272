//! Transport record envelope
//! Every message on either channel is one JSON envelope

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::PlayerId;

/// What an envelope carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Latency ping
    Ping,
    /// Answer to a latency ping
    Pong,
    /// Participant joined the session
    Join,
    /// Participant left the session
    Leave,
    /// Game command, forwarded to the deduplicator
    Command,
    /// Full snapshot of a sync round
    Snapshot,
    /// Incremental sync payload
    CriticalDelta,
}

impl RecordKind {
    /// Records handled by the transport layer rather than the game
    pub fn is_transport_level(self) -> bool {
        matches!(self, Self::Ping | Self::Pong | Self::Join | Self::Leave)
    }
}

/// Wire envelope `{type, payload, senderId, serverTimestamp}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub sender_id: PlayerId,
    /// Set by the broadcast log when the record is appended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<i64>,
    /// Append position in the broadcast log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl Envelope {
    pub fn new<T: Serialize>(
        kind: RecordKind,
        sender_id: &str,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind,
            payload: serde_json::to_value(payload)?,
            sender_id: sender_id.to_string(),
            server_timestamp: None,
            sequence: None,
        })
    }

    /// Envelope with an empty payload (join/leave)
    pub fn bare(kind: RecordKind, sender_id: &str) -> Self {
        Self {
            kind,
            payload: serde_json::Value::Null,
            sender_id: sender_id.to_string(),
            server_timestamp: None,
            sequence: None,
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Parse the payload into its concrete type
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(T::deserialize(&self.payload)?)
    }
}

/// `ping{sentAt}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub sent_at: i64,
}

/// `pong{originalSentAt}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub original_sent_at: i64,
}

/// Malformed or inconsistent data at the transport boundary
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("snapshot checksum mismatch: carried {carried}, computed {computed}")]
    ChecksumMismatch { carried: String, computed: String },
}
