//! Outbound command and record fan-out over both channels

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{error, trace, warn};

use crate::protocol::{Command, CommandAction, CommandId, Envelope, ProtocolError, RecordKind};
use crate::transport::{Transport, TransportError};
use crate::util::time::unix_millis;

/// Stamps commands with ids and sends them on both channels
pub struct CommandDispatcher {
    player_id: String,
    counter: AtomicU64,
    peer: Arc<dyn Transport>,
    log: Arc<dyn Transport>,
}

impl CommandDispatcher {
    pub fn new(player_id: &str, peer: Arc<dyn Transport>, log: Arc<dyn Transport>) -> Self {
        Self {
            player_id: player_id.to_string(),
            counter: AtomicU64::new(1),
            peer,
            log,
        }
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    /// Give an action a fresh, session-unique command id
    pub fn stamp(&self, action: CommandAction) -> Command {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        let timestamp = unix_millis();
        Command::new(
            CommandId::generate(&self.player_id, counter, timestamp),
            self.player_id.clone(),
            timestamp,
            action,
        )
    }

    /// Fire and forget: peer first, then always the log.
    /// Only the log send is relied on for delivery.
    pub fn dispatch(&self, command: &Command) {
        let bytes = match Envelope::new(RecordKind::Command, &self.player_id, command)
            .and_then(|e| e.encode())
        {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(command_id = %command.id(), error = %e, "Failed to encode command");
                return;
            }
        };

        if let Err(e) = self.peer.send(bytes.clone()) {
            warn!(command_id = %command.id(), error = %e, "Peer send failed, relying on log");
        }
        match self.log.send(bytes) {
            Ok(ack) => trace!(command_id = %command.id(), sequence = ?ack.sequence, "Command logged"),
            Err(e) => error!(command_id = %command.id(), error = %e, "Log send failed"),
        }
    }

    /// Publish a sync record on the log channel only
    pub fn publish(&self, kind: RecordKind, payload: &impl serde::Serialize) -> Result<(), DispatchError> {
        let bytes = Envelope::new(kind, &self.player_id, payload)?.encode()?;
        self.log.send(bytes)?;
        Ok(())
    }

    /// Send a transport-level record on one channel
    pub fn send_on(&self, transport: &dyn Transport, envelope: &Envelope) -> Result<(), DispatchError> {
        transport.send(envelope.encode()?)?;
        Ok(())
    }

    pub fn peer(&self) -> &Arc<dyn Transport> {
        &self.peer
    }

    pub fn log(&self) -> &Arc<dyn Transport> {
        &self.log
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Position, RecordKind};
    use crate::relay::log::SessionLog;
    use crate::transport::{MemoryLogChannel, MemoryPeerChannel};

    fn move_action() -> CommandAction {
        CommandAction::UnitMove {
            unit_ids: vec!["u1".into()],
            target_position: Position::new(100.0, 50.0),
            is_attack_move: false,
        }
    }

    #[test]
    fn stamped_ids_are_unique_and_prefixed() {
        let (a, _b) = MemoryPeerChannel::pair(4);
        let (c, _d) = MemoryPeerChannel::pair(4);
        let dispatcher = CommandDispatcher::new("blue", Arc::new(a), Arc::new(c));

        let first = dispatcher.stamp(move_action());
        let second = dispatcher.stamp(move_action());
        assert_ne!(first.id(), second.id());
        assert!(first.id().as_str().starts_with("blue_1_"));
        assert!(second.id().as_str().starts_with("blue_2_"));
    }

    #[tokio::test]
    async fn dispatch_reaches_log_when_peer_is_down() {
        let log = Arc::new(SessionLog::new("room", 100));
        let (peer, remote) = MemoryPeerChannel::pair(4);
        remote.close();
        let channel = MemoryLogChannel::join(log.clone(), "blue", 8);
        let dispatcher = CommandDispatcher::new("blue", Arc::new(peer), Arc::new(channel));

        let command = dispatcher.stamp(move_action());
        dispatcher.dispatch(&command);

        let records = log.replay_since(0);
        assert_eq!(records.len(), 1);
        let envelope = Envelope::decode(&records[0].1).unwrap();
        assert_eq!(envelope.kind, RecordKind::Command);
        assert_eq!(envelope.payload_as::<Command>().unwrap(), command);
    }

    #[tokio::test]
    async fn dispatch_sends_on_both_channels() {
        let log = Arc::new(SessionLog::new("room", 100));
        let (peer, remote) = MemoryPeerChannel::pair(4);
        let mut remote_rx = remote.take_receiver().unwrap();
        let channel = MemoryLogChannel::join(log.clone(), "blue", 8);
        let dispatcher = CommandDispatcher::new("blue", Arc::new(peer), Arc::new(channel));

        dispatcher.dispatch(&dispatcher.stamp(move_action()));

        let via_peer = Envelope::decode(&remote_rx.recv().await.unwrap()).unwrap();
        assert_eq!(via_peer.kind, RecordKind::Command);
        assert_eq!(log.last_sequence(), 1);
    }
}
