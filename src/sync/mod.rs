//! The synchronization engine
//!
//! Commands flow out through the [`CommandDispatcher`] on both channels and
//! come back in through the [`CommandProcessor`], which applies each one at
//! most once. The [`SyncCoordinator`] periodically compares full snapshots
//! with the peer and repairs divergence; the health scan feeds the same
//! desync counter that forces an early full sync. [`SyncSession`] owns the
//! timers and channel listeners for one player.

pub mod capture;
pub mod coordinator;
pub mod dedup;
pub mod dispatcher;
pub mod health;
pub mod processor;
pub mod reconcile;
pub mod session;
pub mod state;

pub use coordinator::{FullSyncOutcome, SyncCoordinator, SyncError, SyncTrigger};
pub use dedup::ProcessedIdSet;
pub use dispatcher::{CommandDispatcher, DispatchError};
pub use health::HealthReport;
pub use processor::{CommandError, CommandProcessor};
pub use reconcile::{DeltaReport, ReconcileMode, ReconcileReport};
pub use session::{SessionError, SyncSession};
pub use state::{SessionState, SharedState, SyncPhase, SyncStats, SyncStatus};
