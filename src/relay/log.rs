//! Append-only session log with fan-out and replay

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::protocol::{Envelope, ProtocolError};
use crate::util::time::unix_millis;

/// Fan-out buffer per session; slow followers fall back to replay
const FANOUT_CAPACITY: usize = 256;

/// A record as stored: its sequence and encoded envelope
pub type LogRecord = (u64, Bytes);

/// The durable, ordered log of one session.
///
/// Every append is stamped with a monotonically increasing sequence and the
/// server time, retained for replay, optionally written to disk, and fanned
/// out to every follower.
pub struct SessionLog {
    session_id: String,
    max_records: usize,
    inner: Mutex<LogInner>,
    fanout: broadcast::Sender<LogRecord>,
}

struct LogInner {
    records: VecDeque<LogRecord>,
    last_sequence: u64,
    file: Option<File>,
}

impl SessionLog {
    /// In-memory log
    pub fn new(session_id: &str, max_records: usize) -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            session_id: session_id.to_string(),
            max_records: max_records.max(1),
            inner: Mutex::new(LogInner {
                records: VecDeque::new(),
                last_sequence: 0,
                file: None,
            }),
            fanout,
        }
    }

    /// Log persisted as JSON lines under `dir`, reloading what is already there
    pub fn open(session_id: &str, max_records: usize, dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.jsonl", sanitize(session_id)));
        let log = Self::new(session_id, max_records);

        {
            let mut inner = log.inner.lock();
            if path.exists() {
                for line in fs::read_to_string(&path)?.lines() {
                    match Envelope::decode(line.as_bytes()) {
                        Ok(envelope) => {
                            let sequence = envelope.sequence.unwrap_or(inner.last_sequence + 1);
                            inner.last_sequence = inner.last_sequence.max(sequence);
                            inner.records.push_back((sequence, Bytes::from(line.to_string())));
                            if inner.records.len() > log.max_records {
                                inner.records.pop_front();
                            }
                        }
                        Err(e) => warn!(session_id, error = %e, "Skipping corrupt log line"),
                    }
                }
                debug!(session_id, records = inner.records.len(), "Reloaded session log");
            }
            inner.file = Some(OpenOptions::new().create(true).append(true).open(&path)?);
        }

        Ok(log)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Stamp and append a record, then fan it out. Returns its sequence.
    pub fn append(&self, mut envelope: Envelope) -> Result<u64, ProtocolError> {
        let mut inner = self.inner.lock();
        let sequence = inner.last_sequence + 1;
        envelope.sequence = Some(sequence);
        envelope.server_timestamp = Some(unix_millis());
        let bytes = envelope.encode()?;

        if let Some(file) = inner.file.as_mut() {
            let written = file
                .write_all(&bytes)
                .and_then(|_| file.write_all(b"\n"));
            if let Err(e) = written {
                warn!(session_id = %self.session_id, error = %e, "Failed to persist log record");
            }
        }

        inner.last_sequence = sequence;
        inner.records.push_back((sequence, bytes.clone()));
        if inner.records.len() > self.max_records {
            inner.records.pop_front();
        }

        // No followers is fine; the record stays available for replay
        let _ = self.fanout.send((sequence, bytes));
        Ok(sequence)
    }

    /// Retained records with a sequence greater than `since`
    pub fn replay_since(&self, since: u64) -> Vec<LogRecord> {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|(sequence, _)| *sequence > since)
            .cloned()
            .collect()
    }

    pub fn last_sequence(&self) -> u64 {
        self.inner.lock().last_sequence
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Follow the log from after `since`: retained records first, then live ones
    pub fn follow(self: &Arc<Self>, since: u64) -> LogCursor {
        let inner = self.inner.lock();
        let live = self.fanout.subscribe();
        let pending = inner
            .records
            .iter()
            .filter(|(sequence, _)| *sequence > since)
            .cloned()
            .collect();
        drop(inner);

        LogCursor {
            log: Arc::clone(self),
            live,
            pending,
            last_delivered: since,
        }
    }

    /// Follow only records appended from now on
    pub fn follow_tail(self: &Arc<Self>) -> LogCursor {
        let since = self.last_sequence();
        self.follow(since)
    }
}

/// Reads a session log in order without gaps or repeats
pub struct LogCursor {
    log: Arc<SessionLog>,
    live: broadcast::Receiver<LogRecord>,
    pending: VecDeque<LogRecord>,
    last_delivered: u64,
}

impl LogCursor {
    /// Next record, or `None` once the log is gone
    pub async fn next(&mut self) -> Option<LogRecord> {
        loop {
            if let Some((sequence, bytes)) = self.pending.pop_front() {
                if sequence > self.last_delivered {
                    self.last_delivered = sequence;
                    return Some((sequence, bytes));
                }
                continue;
            }

            match self.live.recv().await {
                Ok((sequence, bytes)) => {
                    if sequence > self.last_delivered {
                        self.last_delivered = sequence;
                        return Some((sequence, bytes));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(
                        session_id = %self.log.session_id,
                        skipped,
                        "Log follower lagged, replaying"
                    );
                    self.pending = self.log.replay_since(self.last_delivered).into();
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn last_delivered(&self) -> u64 {
        self.last_delivered
    }
}

fn sanitize(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
