//! Broadcast-log relay: one ordered, replayable log per session

pub mod handler;
pub mod log;
pub mod registry;

pub use handler::session_ws_handler;
pub use log::{LogCursor, LogRecord, SessionLog};
pub use registry::{Attachment, SessionHandle, SessionRegistry};
