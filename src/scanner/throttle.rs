use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ScanThrottlePolicy;

/// Sliding-window limiter for platform scan starts.
#[derive(Debug)]
pub(crate) struct ScanStartThrottle {
    policy: ScanThrottlePolicy,
    starts: VecDeque<Instant>,
}

impl ScanStartThrottle {
    pub(crate) fn new(policy: ScanThrottlePolicy) -> Self {
        Self {
            policy,
            starts: VecDeque::with_capacity(policy.max_starts),
        }
    }

    /// Records a start at `now`, or returns how long until one is allowed.
    pub(crate) fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        if self.policy.is_unlimited() {
            return Ok(());
        }
        while let Some(&oldest) = self.starts.front() {
            if now.saturating_duration_since(oldest) >= self.policy.window {
                self.starts.pop_front();
            } else {
                break;
            }
        }
        if self.starts.len() < self.policy.max_starts {
            self.starts.push_back(now);
            return Ok(());
        }
        let oldest = self.starts.front().copied().unwrap_or(now);
        Err(self
            .policy
            .window
            .saturating_sub(now.saturating_duration_since(oldest)))
    }
}
