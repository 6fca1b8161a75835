//! Error types for pollstream.
//!
//! All errors that can occur within the engine and session runtime are
//! represented by [`PollStreamError`]. Errors are propagated via
//! `Result<T, PollStreamError>` throughout the codebase; an HTTP layer
//! embedding this crate maps them to status codes at its boundary.
//!
//! # Error Classification
//!
//! Errors are classified into four categories that determine retry behavior:
//! - **User** — invalid session configuration, malformed submissions,
//!   writes against a closed session. Never retried.
//! - **NotFound** — unknown session, visualization, or question.
//! - **System** — persistence write races, subscriber overflow, a session
//!   task that went away. Write races are retried on deferred ticks.
//! - **Internal** — runtime invariant violations. Not retried; the tick
//!   that detected them is aborted and the state re-derived.
//!
//! # Write races
//!
//! [`RetryPolicy`] governs how a session responds to losing a snapshot
//! write race: the drained batch stays queued and the session sits out a
//! number of ticks that doubles with every consecutive loss, up to a cap.
//! Deferral is counted in ticks rather than wall time because the tick
//! timer is the only clock a session task acts on; the tick that ends the
//! deferral replays the batch against freshly reloaded state.

use std::fmt;

/// Primary error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum PollStreamError {
    // ── User errors — fail, don't retry ──────────────────────────────────
    /// The session configuration violates a structural invariant.
    #[error("invalid session configuration: {0}")]
    ConfigInvalid(String),

    /// A write was attempted against a session that is not open.
    #[error("session {0} is not open")]
    NotOpen(String),

    /// A submission payload is malformed (unknown question, duplicate
    /// answer). The whole submission is rejected.
    #[error("submission rejected: {0}")]
    IngestRejected(String),

    // ── Not-found errors ─────────────────────────────────────────────────
    /// The referenced session, visualization, or question does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    // ── System errors — retry or degrade ─────────────────────────────────
    /// The persistence layer reported a conflicting concurrent write.
    /// The session task reloads state and retries on the next tick.
    #[error("persistence race lost: {0}")]
    RaceLost(String),

    /// A subscriber's outbound queue overflowed; the subscription is
    /// dropped. Not fatal to the session.
    #[error("subscriber backpressure: {0}")]
    SubscriberBackpressure(String),

    /// The session task's command channel is closed (session deleted or
    /// runtime shut down). Surfaced as not-found at the registry edge.
    #[error("session channel closed: {0}")]
    ChannelClosed(String),

    // ── Internal errors — should not happen ──────────────────────────────
    /// A runtime invariant check failed. The tick is aborted and logged;
    /// the session continues accepting writes and the next tick re-derives
    /// state from the statistics.
    #[error("internal invariant violation: {0}")]
    InternalInvariantViolation(String),
}

impl PollStreamError {
    /// Whether the session runtime should retry the failed operation.
    ///
    /// Only persistence write races are retryable; everything else either
    /// fails the request or degrades the single subscriber involved.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PollStreamError::RaceLost(_))
    }

    /// Whether the error is fatal to the request but not to the session.
    pub fn is_session_safe(&self) -> bool {
        !matches!(self, PollStreamError::InternalInvariantViolation(_))
    }
}

/// Classification of error severity/kind for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    User,
    NotFound,
    System,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::User => write!(f, "USER"),
            ErrorKind::NotFound => write!(f, "NOT_FOUND"),
            ErrorKind::System => write!(f, "SYSTEM"),
            ErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl PollStreamError {
    /// Classify the error for monitoring and alerting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PollStreamError::ConfigInvalid(_)
            | PollStreamError::NotOpen(_)
            | PollStreamError::IngestRejected(_) => ErrorKind::User,

            PollStreamError::NotFound(_) => ErrorKind::NotFound,

            PollStreamError::RaceLost(_)
            | PollStreamError::SubscriberBackpressure(_)
            | PollStreamError::ChannelClosed(_) => ErrorKind::System,

            PollStreamError::InternalInvariantViolation(_) => ErrorKind::Internal,
        }
    }
}

// ── Write-race deferral ────────────────────────────────────────────────────

/// Deferral policy for ticks that lose the persistence write race.
///
/// A losing tick never drops work: its batch goes back into the buffer
/// and the session sits out whole ticks before trying again. The first
/// loss defers by `initial_defer_ticks`; each further consecutive loss
/// doubles the deferral until `max_defer_ticks`. There is no give-up
/// threshold: persistence is last-writer-wins, so a conflicting writer
/// always finishes and the next undeferred tick rolls forward from
/// whatever state it left behind.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Ticks sat out after the first consecutive loss.
    pub initial_defer_ticks: u32,
    /// Upper bound on the deferral, in ticks.
    pub max_defer_ticks: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_defer_ticks: 1, // skip the very next tick
            max_defer_ticks: 8,     // 24 s of quiet at the default period
        }
    }
}

impl RetryPolicy {
    /// Ticks to sit out after `losses` consecutive lost races.
    ///
    /// Zero losses defer nothing; otherwise the deferral doubles per
    /// loss, clamped to `max_defer_ticks`.
    pub fn defer_ticks(&self, losses: u32) -> u32 {
        if losses == 0 {
            return 0;
        }
        // Shift capped well below 32 so the doubling can never wrap.
        let doubling = 1u32 << (losses - 1).min(16);
        self.initial_defer_ticks
            .saturating_mul(doubling)
            .min(self.max_defer_ticks)
    }
}

// ── Per-session deferral state ─────────────────────────────────────────────

/// Consecutive-loss bookkeeping for one session's snapshot writes.
///
/// Held in-memory by the session task, never persisted: after a task
/// restart the session starts optimistic again, which is safe because
/// deferral only trades latency for write-pressure.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    losses: u32,
    ticks_to_sit_out: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of consecutive lost races since the last successful write.
    pub fn consecutive_losses(&self) -> u32 {
        self.losses
    }

    /// Record one lost race and arm the deferral for it.
    pub fn record_loss(&mut self, policy: &RetryPolicy) {
        self.losses += 1;
        self.ticks_to_sit_out = policy.defer_ticks(self.losses);
    }

    /// Ask whether the current tick should be sat out.
    ///
    /// Consumes one deferred tick per call, so the caller must invoke it
    /// at most once per tick that actually has queued work.
    pub fn consume_deferral(&mut self) -> bool {
        if self.ticks_to_sit_out > 0 {
            self.ticks_to_sit_out -= 1;
            true
        } else {
            false
        }
    }

    /// Clear all bookkeeping after a successful write.
    pub fn reset(&mut self) {
        self.losses = 0;
        self.ticks_to_sit_out = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            PollStreamError::ConfigInvalid("x".into()).kind(),
            ErrorKind::User
        );
        assert_eq!(
            PollStreamError::NotOpen("abc".into()).kind(),
            ErrorKind::User
        );
        assert_eq!(
            PollStreamError::NotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            PollStreamError::RaceLost("x".into()).kind(),
            ErrorKind::System
        );
        assert_eq!(
            PollStreamError::InternalInvariantViolation("x".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(PollStreamError::RaceLost("x".into()).is_retryable());

        assert!(!PollStreamError::ConfigInvalid("x".into()).is_retryable());
        assert!(!PollStreamError::SubscriberBackpressure("x".into()).is_retryable());
        assert!(!PollStreamError::InternalInvariantViolation("x".into()).is_retryable());
    }

    #[test]
    fn test_session_safe() {
        assert!(PollStreamError::RaceLost("x".into()).is_session_safe());
        assert!(PollStreamError::NotOpen("x".into()).is_session_safe());
        assert!(!PollStreamError::InternalInvariantViolation("x".into()).is_session_safe());
    }

    #[test]
    fn test_not_open_message() {
        let err = PollStreamError::NotOpen("abc123".into());
        assert!(format!("{err}").contains("is not open"));
    }

    #[test]
    fn test_defer_ticks_doubles_to_cap() {
        let policy = RetryPolicy {
            initial_defer_ticks: 1,
            max_defer_ticks: 6,
        };
        assert_eq!(policy.defer_ticks(0), 0);
        assert_eq!(policy.defer_ticks(1), 1);
        assert_eq!(policy.defer_ticks(2), 2);
        assert_eq!(policy.defer_ticks(3), 4);
        assert_eq!(policy.defer_ticks(4), 6); // 8 clamped to the cap
        assert_eq!(policy.defer_ticks(12), 6);
    }

    #[test]
    fn test_defer_ticks_respects_initial_step() {
        let policy = RetryPolicy {
            initial_defer_ticks: 3,
            max_defer_ticks: 10,
        };
        assert_eq!(policy.defer_ticks(1), 3);
        assert_eq!(policy.defer_ticks(2), 6);
        assert_eq!(policy.defer_ticks(3), 10); // 12 clamped
    }

    #[test]
    fn test_defer_ticks_never_overflows() {
        let policy = RetryPolicy {
            initial_defer_ticks: u32::MAX,
            max_defer_ticks: u32::MAX,
        };
        assert_eq!(policy.defer_ticks(u32::MAX), u32::MAX);
    }

    #[test]
    fn test_state_counts_down_per_tick() {
        let policy = RetryPolicy {
            initial_defer_ticks: 1,
            max_defer_ticks: 8,
        };
        let mut state = RetryState::new();
        assert!(!state.consume_deferral());

        // Two consecutive losses arm a two-tick deferral.
        state.record_loss(&policy);
        state.record_loss(&policy);
        assert_eq!(state.consecutive_losses(), 2);
        assert!(state.consume_deferral());
        assert!(state.consume_deferral());
        assert!(!state.consume_deferral());
    }

    #[test]
    fn test_state_new_loss_rearms_deferral() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::new();

        state.record_loss(&policy);
        assert!(state.consume_deferral());
        assert!(!state.consume_deferral());

        // The retried tick loses again: deferral re-arms, doubled.
        state.record_loss(&policy);
        assert_eq!(state.consecutive_losses(), 2);
        assert!(state.consume_deferral());
        assert!(state.consume_deferral());
        assert!(!state.consume_deferral());
    }

    #[test]
    fn test_state_reset_clears_everything() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::new();
        state.record_loss(&policy);
        state.record_loss(&policy);

        state.reset();
        assert_eq!(state.consecutive_losses(), 0);
        assert!(!state.consume_deferral());
    }
}
