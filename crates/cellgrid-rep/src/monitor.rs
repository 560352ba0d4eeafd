//! Monitor probe tracking for LRP instances.
//!
//! An instance starts in `Starting` and is probed at the fast interval until
//! its first passing probe. From then on it is probed at the healthy
//! interval; `unhealthy_threshold` consecutive failures mark it `Unhealthy`,
//! at which point the supervisor crashes it.

use std::time::Duration;

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(Debug)]
pub struct ProbeTracker {
    status: ProbeStatus,
    consecutive_failures: u32,
    unhealthy_threshold: u32,
    starting_interval: Duration,
    healthy_interval: Duration,
}

impl ProbeTracker {
    pub fn new(starting_interval: Duration, healthy_interval: Duration) -> Self {
        Self {
            status: ProbeStatus::Starting,
            consecutive_failures: 0,
            unhealthy_threshold: 1,
            starting_interval,
            healthy_interval,
        }
    }

    pub fn with_threshold(mut self, unhealthy_threshold: u32) -> Self {
        self.unhealthy_threshold = unhealthy_threshold.max(1);
        self
    }

    /// Record one probe and return the new status.
    pub fn record(&mut self, passed: bool) -> ProbeStatus {
        if passed {
            if self.status != ProbeStatus::Healthy {
                debug!(failures = self.consecutive_failures, "instance passed its monitor");
            }
            self.consecutive_failures = 0;
            self.status = ProbeStatus::Healthy;
            return self.status;
        }

        self.consecutive_failures += 1;
        if self.status == ProbeStatus::Healthy
            && self.consecutive_failures >= self.unhealthy_threshold
        {
            warn!(
                failures = self.consecutive_failures,
                threshold = self.unhealthy_threshold,
                "instance marked unhealthy"
            );
            self.status = ProbeStatus::Unhealthy;
        }
        self.status
    }

    pub fn status(&self) -> ProbeStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay before the next probe.
    pub fn next_interval(&self) -> Duration {
        match self.status {
            ProbeStatus::Healthy => self.healthy_interval,
            _ => self.starting_interval,
        }
    }
}
