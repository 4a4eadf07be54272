//! Landfall state synchronization
//!
//! Keeps two players' simulations consistent over a best-effort peer link
//! backed by a durable broadcast log, and hosts that log as a relay server.

pub mod app;
pub mod config;
pub mod http;
pub mod protocol;
pub mod relay;
pub mod sim;
pub mod sync;
pub mod transport;
pub mod util;

pub use config::{ConfigError, RelayConfig, SyncConfig};
pub use sim::{Simulation, World};
pub use sync::{SyncSession, SyncStatus};
