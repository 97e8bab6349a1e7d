//! Fixed-window message quota for the pro tier.

use serde::{ Serialize, Deserialize };

pub const DEFAULT_CAP: u32 = 7;
pub const DEFAULT_WINDOW_HOURS: u64 = 7;
const HOUR_MS: i64 = 60 * 60 * 1000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
    pub count: u32,
    /// Epoch milliseconds at which the current window ends.
    pub reset_time: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied {
        reset_time: i64,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub cap: u32,
    pub window_ms: i64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CAP, DEFAULT_WINDOW_HOURS)
    }
}

impl RateLimitPolicy {
    pub fn new(cap: u32, window_hours: u64) -> Self {
        Self {
            cap,
            window_ms: (window_hours as i64).saturating_mul(HOUR_MS),
        }
    }

    /// The window rolls over lazily on the first request after `reset_time`.
    /// A denial hands back the state untouched.
    pub fn check(&self, now: i64, state: &RateLimitState) -> (RateDecision, RateLimitState) {
        if now > state.reset_time {
            let next = RateLimitState {
                count: 1,
                reset_time: now.saturating_add(self.window_ms),
            };
            return (RateDecision::Allowed, next);
        }
        if state.count >= self.cap {
            return (RateDecision::Denied { reset_time: state.reset_time }, *state);
        }
        (
            RateDecision::Allowed,
            RateLimitState {
                count: state.count + 1,
                reset_time: state.reset_time,
            },
        )
    }

    /// Applied to a state read back from storage: an expired window starts
    /// over from zero.
    pub fn on_load(&self, now: i64, stored: RateLimitState) -> RateLimitState {
        if now > stored.reset_time {
            RateLimitState::default()
        } else {
            stored
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn eighth_send_in_window_is_denied() {
        let policy = RateLimitPolicy::default();
        let mut state = RateLimitState::default();
        for i in 0..7 {
            let (decision, next) = policy.check(NOW + i, &state);
            assert!(decision.is_allowed(), "send {} should pass", i + 1);
            state = next;
        }
        assert_eq!(state.count, 7);
        assert_eq!(state.reset_time, NOW + 7 * HOUR_MS);

        let (decision, after) = policy.check(NOW + 10, &state);
        assert_eq!(decision, RateDecision::Denied { reset_time: state.reset_time });
        assert_eq!(after, state);
    }

    #[test]
    fn send_after_reset_starts_new_window() {
        let policy = RateLimitPolicy::default();
        let state = RateLimitState { count: 7, reset_time: NOW };
        let (decision, next) = policy.check(NOW + 1, &state);
        assert!(decision.is_allowed());
        assert_eq!(next, RateLimitState { count: 1, reset_time: NOW + 1 + 7 * HOUR_MS });
    }

    #[test]
    fn reset_instant_itself_is_still_inside_window() {
        let policy = RateLimitPolicy::new(1, 1);
        let state = RateLimitState { count: 1, reset_time: NOW };
        assert!(!policy.check(NOW, &state).0.is_allowed());
    }

    #[test]
    fn expired_state_is_cleared_on_load() {
        let policy = RateLimitPolicy::default();
        let stale = RateLimitState { count: 5, reset_time: NOW - 1 };
        assert_eq!(policy.on_load(NOW, stale), RateLimitState::default());
        let live = RateLimitState { count: 5, reset_time: NOW + 1 };
        assert_eq!(policy.on_load(NOW, live), live);
    }
}
