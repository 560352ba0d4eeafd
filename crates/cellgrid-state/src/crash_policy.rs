//! Restart policy for crashed LRP instances.
//!
//! The first crashes restart immediately; after that the instance waits an
//! exponentially growing backoff measured from its last crash, capped at a
//! maximum. Past `max_restart_attempts` it stays crashed.

use std::time::Duration;

use cellgrid_core::CrashPolicyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    RestartNow,
    /// Restart once this much time has passed since the last crash.
    WaitUntil(Duration),
    GiveUp,
}

/// Largest shift that still fits the `u32` multiplier.
const MAX_BACKOFF_EXPONENT: u32 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashPolicy {
    pub immediate_restarts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_restart_attempts: u32,
}

impl Default for CrashPolicy {
    fn default() -> Self {
        Self::from(&CrashPolicyConfig::default())
    }
}

impl From<&CrashPolicyConfig> for CrashPolicy {
    fn from(config: &CrashPolicyConfig) -> Self {
        Self {
            immediate_restarts: config.immediate_restarts,
            base_backoff: config.base_backoff,
            max_backoff: config.max_backoff,
            max_restart_attempts: config.max_restart_attempts,
        }
    }
}

impl CrashPolicy {
    /// Backoff owed by an instance that has crashed `crash_count` times.
    pub fn backoff(&self, crash_count: u32) -> Duration {
        if crash_count < self.immediate_restarts {
            return Duration::ZERO;
        }
        let exponent = (crash_count - self.immediate_restarts).min(MAX_BACKOFF_EXPONENT);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn decide(&self, crash_count: u32, elapsed_since_crash: Duration) -> RestartDecision {
        if crash_count >= self.max_restart_attempts {
            return RestartDecision::GiveUp;
        }
        let backoff = self.backoff(crash_count);
        if elapsed_since_crash >= backoff {
            RestartDecision::RestartNow
        } else {
            RestartDecision::WaitUntil(backoff)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_crashes_restart_immediately() {
        let policy = CrashPolicy::default();
        assert_eq!(policy.decide(0, Duration::ZERO), RestartDecision::RestartNow);
        assert_eq!(policy.decide(1, Duration::ZERO), RestartDecision::RestartNow);
        assert_eq!(policy.decide(2, Duration::ZERO), RestartDecision::RestartNow);
    }

    #[test]
    fn third_crash_waits_thirty_seconds() {
        let policy = CrashPolicy::default();
        assert_eq!(
            policy.decide(3, Duration::from_secs(15)),
            RestartDecision::WaitUntil(Duration::from_secs(30))
        );
        assert_eq!(
            policy.decide(3, Duration::from_secs(30)),
            RestartDecision::RestartNow
        );
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = CrashPolicy::default();
        assert_eq!(policy.backoff(4), Duration::from_secs(60));
        assert_eq!(policy.backoff(5), Duration::from_secs(120));
        assert_eq!(policy.backoff(8), Duration::from_secs(16 * 60));
        assert_eq!(policy.backoff(9), Duration::from_secs(16 * 60));
        assert_eq!(policy.backoff(150), Duration::from_secs(16 * 60));
    }

    #[test]
    fn backoff_never_decreases() {
        let policy = CrashPolicy::default();
        let mut previous = Duration::ZERO;
        for count in 0..policy.max_restart_attempts {
            let backoff = policy.backoff(count);
            assert!(backoff >= previous, "backoff shrank at crash {count}");
            assert!(backoff <= policy.max_backoff);
            previous = backoff;
        }
    }

    #[test]
    fn small_base_keeps_doubling_up_to_the_cap() {
        let policy = CrashPolicy {
            immediate_restarts: 0,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(100),
            max_restart_attempts: 200,
        };
        assert_eq!(policy.backoff(5), Duration::from_secs(32));
        assert_eq!(policy.backoff(6), Duration::from_secs(64));
        assert_eq!(policy.backoff(7), Duration::from_secs(100));
        assert_eq!(policy.backoff(199), Duration::from_secs(100));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = CrashPolicy::default();
        assert_eq!(
            policy.decide(200, Duration::from_secs(3600)),
            RestartDecision::GiveUp
        );
        assert_eq!(
            policy.decide(199, Duration::from_secs(3600)),
            RestartDecision::RestartNow
        );
    }
}
