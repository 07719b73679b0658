//! Retry classification and backoff
//!
//! Shared by the blocking and async clients so both make the same
//! decision for the same sequence of errors.
//!
//! ## Schedule
//! - Busy (dataset loading): `busy_base · 2^n`, capped at `busy_max`,
//!   at most `max_busy_retries` times
//! - Transient (I/O, connection, timeout, backend internal):
//!   `base · 2^n` (b, 2b, 4b, ...), at most `max_retries` times
//! - Anything else fails immediately

use std::sync::Arc;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::error::ObjStoreError;
use crate::protocol::Opcode;
use crate::record::EntityKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_busy_retries: u32,
    pub busy_base_delay: Duration,
    pub busy_max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

/// Retries spent so far by one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub retries: u32,
    pub busy_retries: u32,
}

impl RetryState {
    pub fn total(&self) -> u32 {
        self.retries + self.busy_retries
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry { delay: Duration, busy: bool },
    Fail,
}

fn backoff(base: Duration, exponent: u32) -> Duration {
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

impl RetryPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_retry_wait_ms),
            max_busy_retries: config.max_busy_retries,
            busy_base_delay: Duration::from_millis(config.busy_base_wait_ms),
            busy_max_delay: Duration::from_millis(config.busy_max_wait_ms),
        }
    }

    /// Classify `error` and account for the retry in `state`
    pub fn on_error(&self, state: &mut RetryState, error: &ObjStoreError) -> Decision {
        if error.is_busy() {
            if state.busy_retries >= self.max_busy_retries {
                return Decision::Fail;
            }
            let delay = backoff(self.busy_base_delay, state.busy_retries).min(self.busy_max_delay);
            state.busy_retries += 1;
            return Decision::Retry { delay, busy: true };
        }

        if error.is_transient() {
            if state.retries >= self.max_retries {
                return Decision::Fail;
            }
            let delay = backoff(self.base_delay, state.retries);
            state.retries += 1;
            return Decision::Retry {
                delay,
                busy: false,
            };
        }

        Decision::Fail
    }
}

/// Reported to the retry hook before each retry sleep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEvent {
    pub kind: EntityKind,
    pub op: Opcode,
    /// 1-based number of this retry within its class
    pub attempt: u32,
    pub delay: Duration,
    pub busy: bool,
    pub error: String,
}

/// Observer of retry decisions
pub type RetryHook = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_busy_retries: 4,
            busy_base_delay: Duration::from_millis(200),
            busy_max_delay: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_transient_schedule() {
        let policy = policy();
        let mut state = RetryState::default();
        let err = ObjStoreError::Connection("refused".into());

        let delays: Vec<_> = (0..4).map(|_| policy.on_error(&mut state, &err)).collect();
        assert_eq!(
            delays,
            vec![
                Decision::Retry { delay: Duration::from_millis(100), busy: false },
                Decision::Retry { delay: Duration::from_millis(200), busy: false },
                Decision::Retry { delay: Duration::from_millis(400), busy: false },
                Decision::Fail,
            ]
        );
        assert_eq!(state.retries, 3);
    }

    #[test]
    fn test_busy_schedule_is_capped_and_bounded() {
        let policy = policy();
        let mut state = RetryState::default();
        let err = ObjStoreError::Busy("loading".into());

        let delays: Vec<_> = (0..5).map(|_| policy.on_error(&mut state, &err)).collect();
        assert_eq!(delays[0], Decision::Retry { delay: Duration::from_millis(200), busy: true });
        assert_eq!(delays[1], Decision::Retry { delay: Duration::from_millis(400), busy: true });
        assert_eq!(delays[2], Decision::Retry { delay: Duration::from_millis(500), busy: true });
        assert_eq!(delays[4], Decision::Fail);
    }

    #[test]
    fn test_busy_and_transient_budgets_are_separate() {
        let policy = policy();
        let mut state = RetryState::default();
        policy.on_error(&mut state, &ObjStoreError::Busy("loading".into()));
        let d = policy.on_error(&mut state, &ObjStoreError::Timeout("slow".into()));
        assert_eq!(d, Decision::Retry { delay: Duration::from_millis(100), busy: false });
        assert_eq!(state.total(), 2);
    }

    #[test]
    fn test_permanent_errors_fail_fast() {
        let policy = policy();
        let mut state = RetryState::default();
        for err in [
            ObjStoreError::Command("WRONGTYPE".into()),
            ObjStoreError::Protocol("bad frame".into()),
            ObjStoreError::Config("nope".into()),
        ] {
            assert_eq!(policy.on_error(&mut state, &err), Decision::Fail);
        }
        assert_eq!(state.total(), 0);
    }
}
