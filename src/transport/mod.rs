//! Transport channels
//!
//! Two media carry the same envelopes: a low-latency, best-effort peer
//! channel and a durable, ordered broadcast-log channel. Both sit behind
//! [`Transport`] so the dispatcher and the session never care which backend
//! is wired in. Inbound traffic is delivered through a bounded queue handed
//! out once by [`Transport::take_receiver`].

pub mod latency;
pub mod memory;
pub mod ws;

pub use latency::LatencyTracker;
pub use memory::{MemoryLogChannel, MemoryPeerChannel};
pub use ws::{LogEndpoint, WsChannel};

use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::ProtocolError;

/// Which medium a channel uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Direct, best-effort, low latency
    Peer,
    /// Durable, ordered, at-least-once fan-out
    BroadcastLog,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peer => f.write_str("peer"),
            Self::BroadcastLog => f.write_str("broadcast-log"),
        }
    }
}

/// Acknowledgement of a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub channel: ChannelKind,
    /// Log position, when the medium assigns one synchronously
    pub sequence: Option<u64>,
}

impl Ack {
    pub fn queued(channel: ChannelKind) -> Self {
        Self {
            channel,
            sequence: None,
        }
    }
}

/// Transport failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{0} channel is not open")]
    Unavailable(ChannelKind),

    #[error("{0} channel outbound queue is full")]
    Backpressure(ChannelKind),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Inbound side of a channel
pub type InboundQueue = mpsc::Receiver<Bytes>;

/// Common contract of every channel backend
pub trait Transport: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Queue a payload without blocking
    fn send(&self, payload: Bytes) -> Result<Ack, TransportError>;

    /// Hand out the inbound queue; `None` once taken
    fn take_receiver(&self) -> Option<InboundQueue>;

    fn is_open(&self) -> bool;

    /// Close the channel; safe to call more than once
    fn close(&self);
}
