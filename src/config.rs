//! Runtime settings for pollstream.
//!
//! Settings control the session runtime's timing and queue depths. They
//! are read once from environment variables at startup and handed to the
//! [`crate::registry::SessionRegistry`]; individual sessions may override
//! the tick interval and soft budget.
//!
//! Recognized variables:
//! - `BATCH_UPDATE_INTERVAL_MS` — tick period (default 3000)
//! - `SESSION_IDLE_TIMEOUT_MS` — idle-to-sleep threshold (default 300000)
//! - `TICK_SOFT_BUDGET_MS` — soft tick compute budget (default 1000)
//! - `SUBSCRIBER_QUEUE_DEPTH` — per-subscriber outbound queue (default 32)
//! - `COMMAND_QUEUE_DEPTH` — per-session command queue (default 256)
//!
//! Unparseable values fall back to the default with a warning; absent
//! values fall back silently.

use std::time::Duration;

use tracing::warn;

/// Default tick period in milliseconds.
pub const DEFAULT_BATCH_UPDATE_INTERVAL_MS: u64 = 3000;

/// Default idle time before a session flushes state and sleeps.
pub const DEFAULT_SESSION_IDLE_TIMEOUT_MS: u64 = 300_000;

/// Default soft budget for a tick's compute phase.
pub const DEFAULT_TICK_SOFT_BUDGET_MS: u64 = 1000;

/// Default bound of each subscriber's outbound event queue.
pub const DEFAULT_SUBSCRIBER_QUEUE_DEPTH: usize = 32;

/// Default bound of each session's inbound command queue.
pub const DEFAULT_COMMAND_QUEUE_DEPTH: usize = 256;

/// Runtime settings shared by all sessions of a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Tick period: how often a session drains its batch buffer.
    pub batch_update_interval: Duration,
    /// Idle threshold after which a session persists state and sleeps.
    pub session_idle_timeout: Duration,
    /// Soft budget for a tick's compute phase; exceeding it schedules
    /// another tick immediately after the emit.
    pub tick_soft_budget: Duration,
    /// Bound of each subscriber's outbound queue; overflow drops the
    /// subscription.
    pub subscriber_queue_depth: usize,
    /// Bound of each session's command queue.
    pub command_queue_depth: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch_update_interval: Duration::from_millis(DEFAULT_BATCH_UPDATE_INTERVAL_MS),
            session_idle_timeout: Duration::from_millis(DEFAULT_SESSION_IDLE_TIMEOUT_MS),
            tick_soft_budget: Duration::from_millis(DEFAULT_TICK_SOFT_BUDGET_MS),
            subscriber_queue_depth: DEFAULT_SUBSCRIBER_QUEUE_DEPTH,
            command_queue_depth: DEFAULT_COMMAND_QUEUE_DEPTH,
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        if let Some(ms) = read_env_u64("BATCH_UPDATE_INTERVAL_MS") {
            settings.batch_update_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = read_env_u64("SESSION_IDLE_TIMEOUT_MS") {
            settings.session_idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = read_env_u64("TICK_SOFT_BUDGET_MS") {
            settings.tick_soft_budget = Duration::from_millis(ms);
        }
        if let Some(n) = read_env_u64("SUBSCRIBER_QUEUE_DEPTH") {
            settings.subscriber_queue_depth = n.max(1) as usize;
        }
        if let Some(n) = read_env_u64("COMMAND_QUEUE_DEPTH") {
            settings.command_queue_depth = n.max(1) as usize;
        }
        settings
    }

    /// Builder-style override of the tick period (used by tests and by
    /// per-session configuration).
    pub fn with_batch_update_interval(mut self, interval: Duration) -> Self {
        self.batch_update_interval = interval;
        self
    }

    /// Builder-style override of the idle timeout.
    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = timeout;
        self
    }

    /// Builder-style override of the soft tick budget.
    pub fn with_tick_soft_budget(mut self, budget: Duration) -> Self {
        self.tick_soft_budget = budget;
        self
    }

    /// Builder-style override of the subscriber queue depth.
    pub fn with_subscriber_queue_depth(mut self, depth: usize) -> Self {
        self.subscriber_queue_depth = depth.max(1);
        self
    }
}

/// Read a non-negative integer environment variable. Returns `None` when
/// absent; warns and returns `None` when present but unparseable, so the
/// caller keeps the default.
fn read_env_u64(name: &str) -> Option<u64> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(var = name, value = %raw, "ignoring unparseable setting");
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.batch_update_interval, Duration::from_millis(3000));
        assert_eq!(s.session_idle_timeout, Duration::from_millis(300_000));
        assert_eq!(s.tick_soft_budget, Duration::from_millis(1000));
        assert_eq!(s.subscriber_queue_depth, 32);
        assert_eq!(s.command_queue_depth, 256);
    }

    #[test]
    fn test_builder_overrides() {
        let s = Settings::default()
            .with_batch_update_interval(Duration::from_millis(50))
            .with_session_idle_timeout(Duration::from_secs(2))
            .with_tick_soft_budget(Duration::from_millis(10))
            .with_subscriber_queue_depth(4);
        assert_eq!(s.batch_update_interval, Duration::from_millis(50));
        assert_eq!(s.session_idle_timeout, Duration::from_secs(2));
        assert_eq!(s.tick_soft_budget, Duration::from_millis(10));
        assert_eq!(s.subscriber_queue_depth, 4);
    }

    #[test]
    fn test_queue_depth_floor() {
        let s = Settings::default().with_subscriber_queue_depth(0);
        assert_eq!(s.subscriber_queue_depth, 1);
    }

    #[test]
    fn test_from_env_reads_interval() {
        // Env mutation is process-global; use a variable no other test reads.
        unsafe { std::env::set_var("BATCH_UPDATE_INTERVAL_MS", "125") };
        let s = Settings::from_env();
        assert_eq!(s.batch_update_interval, Duration::from_millis(125));
        unsafe { std::env::remove_var("BATCH_UPDATE_INTERVAL_MS") };
    }

    #[test]
    fn test_from_env_ignores_garbage() {
        unsafe { std::env::set_var("TICK_SOFT_BUDGET_MS", "not-a-number") };
        let s = Settings::from_env();
        assert_eq!(s.tick_soft_budget, Duration::from_millis(1000));
        unsafe { std::env::remove_var("TICK_SOFT_BUDGET_MS") };
    }
}
