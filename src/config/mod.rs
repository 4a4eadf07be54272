//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::sync::reconcile::ReconcileMode;

/// Relay server configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines instead of plain text
    pub log_json: bool,
    /// HMAC secret used to sign session tokens
    pub relay_secret: String,
    /// Directory for per-session JSON-lines logs (in-memory only if unset)
    pub log_dir: Option<PathBuf>,
    /// Records retained in memory per session for replay
    pub max_records: usize,
    /// How long an abandoned session's log stays in memory
    pub session_grace: Duration,
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),

            relay_secret: env::var("RELAY_SECRET")
                .map_err(|_| ConfigError::Missing("RELAY_SECRET"))?,
            log_dir: env::var("RELAY_LOG_DIR").ok().map(PathBuf::from),
            max_records: parse_var("RELAY_MAX_RECORDS")?.unwrap_or(10_000),
            session_grace: parse_secs("RELAY_SESSION_GRACE_SECS")?
                .unwrap_or(Duration::from_secs(300)),
        })
    }
}

/// Timings and bounds of the synchronization engine
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Cadence of critical-delta syncs
    pub incremental_interval: Duration,
    /// Cadence of forced full syncs
    pub full_sync_interval: Duration,
    /// Cadence of local health scans
    pub health_interval: Duration,
    /// Cadence of latency pings
    pub ping_interval: Duration,
    /// How long a full sync waits for the peer's snapshot
    pub peer_snapshot_timeout: Duration,
    /// Desync count that forces an immediate full sync
    pub desync_threshold: u32,
    /// Soft bound on remembered command ids
    pub dedup_capacity: usize,
    /// Minimum time a command id is remembered
    pub idempotency_window: Duration,
    /// Health ratio under which a unit is reported in critical deltas
    pub critical_health_ratio: f32,
    /// Latency samples kept per channel
    pub latency_window: usize,
    pub reconcile_mode: ReconcileMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            incremental_interval: Duration::from_secs(15),
            full_sync_interval: Duration::from_secs(120),
            health_interval: Duration::from_secs(5),
            ping_interval: Duration::from_secs(2),
            peer_snapshot_timeout: Duration::from_secs(5),
            desync_threshold: 3,
            dedup_capacity: 1000,
            idempotency_window: Duration::from_secs(60),
            critical_health_ratio: 0.3,
            latency_window: 10,
            reconcile_mode: ReconcileMode::OwnerAuthoritative,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by any `SYNC_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            incremental_interval: parse_secs("SYNC_INCREMENTAL_SECS")?
                .unwrap_or(defaults.incremental_interval),
            full_sync_interval: parse_secs("SYNC_FULL_SECS")?
                .unwrap_or(defaults.full_sync_interval),
            health_interval: parse_secs("SYNC_HEALTH_SECS")?
                .unwrap_or(defaults.health_interval),
            ping_interval: parse_secs("SYNC_PING_SECS")?.unwrap_or(defaults.ping_interval),
            peer_snapshot_timeout: parse_secs("SYNC_PEER_TIMEOUT_SECS")?
                .unwrap_or(defaults.peer_snapshot_timeout),
            desync_threshold: parse_var("SYNC_DESYNC_THRESHOLD")?
                .unwrap_or(defaults.desync_threshold),
            dedup_capacity: parse_var("SYNC_DEDUP_CAPACITY")?.unwrap_or(defaults.dedup_capacity),
            idempotency_window: parse_secs("SYNC_IDEMPOTENCY_SECS")?
                .unwrap_or(defaults.idempotency_window),
            critical_health_ratio: parse_var("SYNC_CRITICAL_HEALTH_RATIO")?
                .unwrap_or(defaults.critical_health_ratio),
            latency_window: defaults.latency_window,
            reconcile_mode: match env::var("SYNC_RECONCILE_MODE") {
                Ok(mode) => mode
                    .parse()
                    .map_err(|_| ConfigError::Invalid("SYNC_RECONCILE_MODE"))?,
                Err(_) => defaults.reconcile_mode,
            },
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(None),
    }
}

fn parse_secs(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_var::<f64>(name)?
        .filter(|secs| *secs > 0.0)
        .map(Duration::from_secs_f64))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
