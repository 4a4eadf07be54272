//! WebSocket channel backends
//!
//! A peer channel is a single direct WebSocket; when it drops it stays
//! closed. A broadcast-log channel talks to the relay and reconnects with
//! `since=<last sequence>` so nothing appended while it was away is lost.
//! Both share the same socket pump.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::{Ack, ChannelKind, InboundQueue, Transport, TransportError};

const MIN_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Where a broadcast-log channel connects
#[derive(Debug, Clone)]
pub struct LogEndpoint {
    /// Relay base URL, e.g. `ws://relay.example:8080`
    pub base_url: String,
    pub session_id: String,
    pub player_id: String,
    /// Session token issued for `session_id:player_id`
    pub token: String,
}

impl LogEndpoint {
    fn url(&self, since: u64) -> String {
        format!(
            "{}/sessions/{}/ws?player={}&token={}&since={}",
            self.base_url.trim_end_matches('/'),
            self.session_id,
            self.player_id,
            self.token,
            since
        )
    }
}

/// A channel backed by a WebSocket
pub struct WsChannel {
    kind: ChannelKind,
    outbound: mpsc::Sender<Bytes>,
    inbound: Mutex<Option<InboundQueue>>,
    /// Socket currently connected
    connected: Arc<AtomicBool>,
    /// `close` was called
    closed: Arc<AtomicBool>,
    last_sequence: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsChannel {
    /// Dial a peer directly
    pub async fn connect_peer(url: &str, capacity: usize) -> Result<Self, TransportError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!(url, "Peer channel connected");
        Ok(Self::spawn_peer(ws, capacity))
    }

    /// Accept a peer that dialled us
    pub async fn accept_peer(stream: TcpStream, capacity: usize) -> Result<Self, TransportError> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!("Peer channel accepted");
        Ok(Self::spawn_peer(ws, capacity))
    }

    fn spawn_peer<S>(ws: WebSocketStream<S>, capacity: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let channel = Self::new(ChannelKind::Peer, out_tx, in_rx);
        channel.connected.store(true, Ordering::SeqCst);

        let connected = channel.connected.clone();
        let last_sequence = channel.last_sequence.clone();
        let task = tokio::spawn(async move {
            let mut outbox = Outbox::new(out_rx);
            pump(ws, &mut outbox, &in_tx, &last_sequence).await;
            connected.store(false, Ordering::SeqCst);
            debug!("Peer channel disconnected");
        });
        *channel.task.lock() = Some(task);
        channel
    }

    /// Connect to the relay's session log, reconnecting until closed.
    /// Sends are buffered while the connection is down, and a send cut off
    /// by a dropped connection is retried first on the next one.
    pub fn connect_log(endpoint: LogEndpoint, capacity: usize) -> Self {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let channel = Self::new(ChannelKind::BroadcastLog, out_tx, in_rx);

        let connected = channel.connected.clone();
        let closed = channel.closed.clone();
        let last_sequence = channel.last_sequence.clone();
        let task = tokio::spawn(async move {
            let mut outbox = Outbox::new(out_rx);
            let mut backoff = MIN_BACKOFF;
            while !closed.load(Ordering::SeqCst) {
                let url = endpoint.url(last_sequence.load(Ordering::SeqCst));
                match tokio_tungstenite::connect_async(url.as_str()).await {
                    Ok((ws, _)) => {
                        info!(session_id = %endpoint.session_id, "Log channel connected");
                        backoff = MIN_BACKOFF;
                        connected.store(true, Ordering::SeqCst);
                        pump(ws, &mut outbox, &in_tx, &last_sequence).await;
                        connected.store(false, Ordering::SeqCst);
                        if in_tx.is_closed() {
                            break;
                        }
                        warn!(session_id = %endpoint.session_id, "Log channel lost, reconnecting");
                    }
                    Err(e) => {
                        warn!(
                            session_id = %endpoint.session_id,
                            error = %e,
                            retry_in_ms = backoff.as_millis() as u64,
                            "Log channel connect failed"
                        );
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        });
        *channel.task.lock() = Some(task);
        channel
    }

    fn new(kind: ChannelKind, outbound: mpsc::Sender<Bytes>, inbound: InboundQueue) -> Self {
        Self {
            kind,
            outbound,
            inbound: Mutex::new(Some(inbound)),
            connected: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            last_sequence: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    /// Highest log sequence delivered so far
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }
}

impl Transport for WsChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn send(&self, payload: Bytes) -> Result<Ack, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(self.kind));
        }
        // Peer sends are pointless while down; log sends wait for the reconnect
        if self.kind == ChannelKind::Peer && !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(self.kind));
        }

        match self.outbound.try_send(payload) {
            Ok(()) => Ok(Ack::queued(self.kind)),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::Backpressure(self.kind)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Unavailable(self.kind)),
        }
    }

    fn take_receiver(&self) -> Option<InboundQueue> {
        self.inbound.lock().take()
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Outbound queue that holds on to a payload until a socket accepted it
struct Outbox {
    queue: mpsc::Receiver<Bytes>,
    in_flight: Option<Bytes>,
}

impl Outbox {
    fn new(queue: mpsc::Receiver<Bytes>) -> Self {
        Self {
            queue,
            in_flight: None,
        }
    }

    /// The payload a broken connection failed to send, else the next queued
    /// one. `None` once the channel side has gone away.
    async fn next(&mut self) -> Option<Bytes> {
        if self.in_flight.is_none() {
            self.in_flight = Some(self.queue.recv().await?);
        }
        self.in_flight.clone()
    }

    fn sent(&mut self) {
        self.in_flight = None;
    }
}

#[derive(Deserialize)]
struct SequenceOnly {
    #[serde(default)]
    sequence: Option<u64>,
}

/// Move frames between a socket and the channel queues until either side ends.
/// Log records at or below `last_sequence` are replays and are skipped.
async fn pump<S>(
    ws: WebSocketStream<S>,
    outbox: &mut Outbox,
    inbound: &mpsc::Sender<Bytes>,
    last_sequence: &AtomicU64,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            payload = outbox.next() => {
                let Some(payload) = payload else {
                    let _ = sink.close().await;
                    break;
                };
                let message = match String::from_utf8(payload.to_vec()) {
                    Ok(text) => Message::text(text),
                    Err(_) => Message::binary(payload),
                };
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "WebSocket send failed, keeping the payload");
                    break;
                }
                outbox.sent();
            }
            frame = stream.next() => {
                let bytes = match frame {
                    Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => Bytes::copy_from_slice(&data),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive failed");
                        break;
                    }
                };

                if let Ok(SequenceOnly { sequence: Some(sequence) }) = serde_json::from_slice(&bytes) {
                    if sequence <= last_sequence.load(Ordering::SeqCst) {
                        continue;
                    }
                    last_sequence.store(sequence, Ordering::SeqCst);
                }

                if inbound.send(bytes).await.is_err() {
                    break;
                }
            }
        }
    }
}
