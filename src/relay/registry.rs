//! Registry of live session logs

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::log::SessionLog;

/// A session's log and how many participants are attached to it
#[derive(Clone)]
pub struct SessionHandle {
    pub log: Arc<SessionLog>,
    connected: Arc<AtomicUsize>,
}

impl SessionHandle {
    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::Relaxed)
    }

    /// Count a participant in until the returned guard drops
    pub fn attach(&self) -> Attachment {
        self.connected.fetch_add(1, Ordering::Relaxed);
        Attachment {
            connected: self.connected.clone(),
        }
    }
}

/// Keeps a participant counted as connected
pub struct Attachment {
    connected: Arc<AtomicUsize>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.connected.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Sessions with a log in memory. Idle sessions are evicted after a grace
/// period; persisted ones reload from disk when a participant returns.
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
    max_records: usize,
    log_dir: Option<PathBuf>,
}

impl SessionRegistry {
    pub fn new(max_records: usize, log_dir: Option<PathBuf>) -> Self {
        Self {
            sessions: DashMap::new(),
            max_records,
            log_dir,
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    /// Attach to an existing session, or open it (reloaded from disk when
    /// persisted). Attaching under the map lock keeps eviction from racing a
    /// participant that is joining.
    pub fn join(&self, session_id: &str) -> io::Result<(SessionHandle, Attachment)> {
        if let Some(handle) = self.sessions.get(session_id) {
            let attachment = handle.attach();
            return Ok((handle.value().clone(), attachment));
        }

        let entry = match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(e) => {
                let attachment = e.get().attach();
                return Ok((e.get().clone(), attachment));
            }
            Entry::Vacant(e) => e,
        };
        let log = match &self.log_dir {
            Some(dir) => SessionLog::open(session_id, self.max_records, dir)?,
            None => SessionLog::new(session_id, self.max_records),
        };
        info!(session_id, records = log.len(), "Opened session log");

        let handle = SessionHandle {
            log: Arc::new(log),
            connected: Arc::new(AtomicUsize::new(0)),
        };
        let attachment = handle.attach();
        entry.insert(handle.clone());
        Ok((handle, attachment))
    }

    /// Drop the session's log if nobody is attached
    pub fn evict_if_idle(&self, session_id: &str) -> bool {
        let evicted = self
            .sessions
            .remove_if(session_id, |_, handle| handle.connected() == 0)
            .is_some();
        if evicted {
            info!(session_id, "Evicted idle session log");
        }
        evicted
    }

    /// Evict the session after `grace` unless someone rejoined by then
    pub fn evict_when_idle(self: &Arc<Self>, session_id: String, grace: Duration) {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match registry.upgrade() {
                Some(registry) => {
                    registry.evict_if_idle(&session_id);
                }
                None => debug!(session_id = %session_id, "Registry gone before eviction"),
            }
        });
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions with at least one participant attached
    pub fn active_sessions(&self) -> usize {
        self.sessions.iter().filter(|s| s.value().connected() > 0).count()
    }

    pub fn connected_players(&self) -> usize {
        self.sessions.iter().map(|s| s.value().connected()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_are_shared_by_id() {
        let registry = SessionRegistry::new(100, None);
        let (a, _blue) = registry.join("room").unwrap();
        let (b, _red) = registry.join("room").unwrap();
        assert!(Arc::ptr_eq(&a.log, &b.log));
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn attachments_count_players() {
        let registry = SessionRegistry::new(100, None);
        let (_, blue) = registry.join("room").unwrap();
        let (_, red) = registry.join("room").unwrap();
        let (_, lone) = registry.join("empty").unwrap();
        drop(lone);
        assert_eq!(registry.connected_players(), 2);
        assert_eq!(registry.active_sessions(), 1);

        drop(blue);
        drop(red);
        assert_eq!(registry.connected_players(), 0);
        assert_eq!(registry.active_sessions(), 0);
    }

    #[test]
    fn only_idle_sessions_are_evicted() {
        let registry = SessionRegistry::new(100, None);
        let (_, blue) = registry.join("room").unwrap();

        assert!(!registry.evict_if_idle("room"));
        assert_eq!(registry.len(), 1);

        drop(blue);
        assert!(registry.evict_if_idle("room"));
        assert!(registry.is_empty());
        assert!(!registry.evict_if_idle("room"));
    }

    #[tokio::test]
    async fn rejoining_within_grace_keeps_the_log() {
        let registry = Arc::new(SessionRegistry::new(100, None));
        let (room, blue) = registry.join("room").unwrap();
        room.log
            .append(crate::protocol::Envelope::bare(crate::protocol::RecordKind::Join, "blue"))
            .unwrap();
        drop(blue);

        registry.evict_when_idle("room".to_string(), Duration::from_millis(30));
        let (_, _back) = registry.join("room").unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let (again, _) = registry.join("room").unwrap();
        assert_eq!(again.log.len(), 1);
    }

    #[tokio::test]
    async fn idle_session_is_evicted_after_grace() {
        let registry = Arc::new(SessionRegistry::new(100, None));
        let (_, blue) = registry.join("room").unwrap();
        drop(blue);

        registry.evict_when_idle("room".to_string(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.is_empty());
    }
}
