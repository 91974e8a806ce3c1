//! Restart policies for supervised children

use std::time::Duration;

/// Delay the shipped policy waits between child runs
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(3);

/// Decides what happens after a child exits
pub trait RestartPolicy: Send {
    /// Delay before the next start, or `None` to stop supervising.
    ///
    /// `consecutive_failures` counts exits in a row since the last run that
    /// stayed up longer than the policy's own notion of healthy; the fixed
    /// policy ignores it.
    fn next_delay(&mut self, consecutive_failures: u32) -> Option<Duration>;
}

/// Always restart after the same delay, no matter how the child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    pub delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self::new(DEFAULT_RESTART_DELAY)
    }
}

impl RestartPolicy for FixedDelay {
    fn next_delay(&mut self, _consecutive_failures: u32) -> Option<Duration> {
        Some(self.delay)
    }
}
