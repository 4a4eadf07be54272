//! Time utilities

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as i64
}

/// Process start time for uptime tracking
static PROCESS_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize start time (call once at startup)
pub fn init_server_time() {
    PROCESS_START.get_or_init(Instant::now);
}

/// Get uptime in seconds
pub fn uptime_secs() -> u64 {
    PROCESS_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_reads_wall_time_and_uptime() {
        assert!(unix_millis() > 1_600_000_000_000);
        init_server_time();
        assert!(uptime_secs() < 60);
    }
}
