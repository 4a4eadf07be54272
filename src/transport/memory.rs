//! In-process channel backends
//!
//! [`MemoryPeerChannel`] links two sessions directly and can drop messages
//! at a seeded random rate; [`MemoryLogChannel`] follows a shared
//! [`SessionLog`] exactly like a relay connection would.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::protocol::Envelope;
use crate::relay::log::SessionLog;

use super::{Ack, ChannelKind, InboundQueue, Transport, TransportError};

struct Loss {
    rng: ChaCha8Rng,
    drop_rate: f64,
}

/// One end of an in-memory peer link
pub struct MemoryPeerChannel {
    to_remote: mpsc::Sender<Bytes>,
    inbound: Mutex<Option<InboundQueue>>,
    /// Shared by both ends: closing either side disconnects the link
    open: Arc<AtomicBool>,
    loss: Option<Mutex<Loss>>,
}

impl MemoryPeerChannel {
    /// Two connected, lossless ends
    pub fn pair(capacity: usize) -> (Self, Self) {
        Self::build(capacity, None)
    }

    /// Two connected ends that each drop `drop_rate` of their sends
    pub fn lossy_pair(capacity: usize, drop_rate: f64, seed: u64) -> (Self, Self) {
        Self::build(capacity, Some((drop_rate.clamp(0.0, 1.0), seed)))
    }

    fn build(capacity: usize, loss: Option<(f64, u64)>) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        let open = Arc::new(AtomicBool::new(true));
        let make_loss = |offset: u64| {
            loss.map(|(drop_rate, seed)| {
                Mutex::new(Loss {
                    rng: ChaCha8Rng::seed_from_u64(seed.wrapping_add(offset)),
                    drop_rate,
                })
            })
        };

        let a = Self {
            to_remote: b_tx,
            inbound: Mutex::new(Some(a_rx)),
            open: open.clone(),
            loss: make_loss(0),
        };
        let b = Self {
            to_remote: a_tx,
            inbound: Mutex::new(Some(b_rx)),
            open,
            loss: make_loss(1),
        };
        (a, b)
    }
}

impl Transport for MemoryPeerChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Peer
    }

    fn send(&self, payload: Bytes) -> Result<Ack, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Unavailable(ChannelKind::Peer));
        }

        if let Some(loss) = &self.loss {
            let mut loss = loss.lock();
            let drop_rate = loss.drop_rate;
            if loss.rng.gen_bool(drop_rate) {
                // Best effort: the sender never learns about the drop
                trace!("Peer link dropped a message");
                return Ok(Ack::queued(ChannelKind::Peer));
            }
        }

        match self.to_remote.try_send(payload) {
            Ok(()) => Ok(Ack::queued(ChannelKind::Peer)),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(TransportError::Backpressure(ChannelKind::Peer))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.open.store(false, Ordering::SeqCst);
                Err(TransportError::Unavailable(ChannelKind::Peer))
            }
        }
    }

    fn take_receiver(&self) -> Option<InboundQueue> {
        self.inbound.lock().take()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// A participant's connection to an in-process session log
pub struct MemoryLogChannel {
    log: Arc<SessionLog>,
    player_id: String,
    inbound: Mutex<Option<InboundQueue>>,
    open: Arc<AtomicBool>,
    follower: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryLogChannel {
    /// Join from the current tail of the log
    pub fn join(log: Arc<SessionLog>, player_id: &str, capacity: usize) -> Self {
        let since = log.last_sequence();
        Self::join_from(log, player_id, capacity, since)
    }

    /// Join and replay every retained record after `since`.
    /// Must be called inside a tokio runtime.
    pub fn join_from(log: Arc<SessionLog>, player_id: &str, capacity: usize, since: u64) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let open = Arc::new(AtomicBool::new(true));
        let mut cursor = log.follow(since);

        let follower_open = open.clone();
        let follower = tokio::spawn(async move {
            while let Some((_, bytes)) = cursor.next().await {
                if tx.send(bytes).await.is_err() {
                    break;
                }
            }
            follower_open.store(false, Ordering::SeqCst);
        });

        Self {
            log,
            player_id: player_id.to_string(),
            inbound: Mutex::new(Some(rx)),
            open,
            follower: Mutex::new(Some(follower)),
        }
    }
}

impl Transport for MemoryLogChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::BroadcastLog
    }

    fn send(&self, payload: Bytes) -> Result<Ack, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Unavailable(ChannelKind::BroadcastLog));
        }

        // The log, not the client, decides who the sender is
        let mut envelope = Envelope::decode(&payload)?;
        envelope.sender_id = self.player_id.clone();
        let sequence = self.log.append(envelope)?;

        Ok(Ack {
            channel: ChannelKind::BroadcastLog,
            sequence: Some(sequence),
        })
    }

    fn take_receiver(&self) -> Option<InboundQueue> {
        self.inbound.lock().take()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!(player_id = %self.player_id, session_id = %self.log.session_id(), "Left session log");
        }
        if let Some(follower) = self.follower.lock().take() {
            follower.abort();
        }
    }
}

impl Drop for MemoryLogChannel {
    fn drop(&mut self) {
        self.close();
    }
}
