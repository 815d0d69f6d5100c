//! Resend backoff.

use std::time::Duration;

use crate::config::NotifierConfig;

/// Exponential backoff for failed deliveries, capped per delay and bounded
/// in the number of resends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_resends: u32,
}

impl ResendPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(base_delay: Duration, max_delay: Duration, max_resends: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_resends,
        }
    }

    /// Policy from the notifier settings.
    #[must_use]
    pub const fn from_config(cfg: &NotifierConfig) -> Self {
        Self::new(cfg.resend_base_delay, cfg.resending_timeout, cfg.max_resend_attempts)
    }

    /// Delay before the next attempt once attempt number `attempt`
    /// (zero-based) has failed, or `None` when no resend is left.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_resends {
            return None;
        }
        let delay = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let policy = ResendPolicy::new(Duration::from_secs(1), Duration::from_secs(5), 5);
        let delays: Vec<_> = (0..6).map(|a| policy.delay_after(a)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(4)),
                Some(Duration::from_secs(5)),
                Some(Duration::from_secs(5)),
                None,
            ]
        );
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = ResendPolicy::new(Duration::from_secs(1), Duration::from_secs(60), u32::MAX);
        assert_eq!(policy.delay_after(40), Some(Duration::from_secs(60)));
    }

    #[test]
    fn zero_resends_means_single_attempt() {
        let policy = ResendPolicy::new(Duration::from_millis(1), Duration::from_secs(1), 0);
        assert_eq!(policy.delay_after(0), None);
    }
}
