use std::time;

#[derive(Copy, Clone, Debug)]
/// How the dispatch stage spaces out repeated enrichment attempts for one message.
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never less than 1.
    max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// A policy that gives up after the first failure.
    pub fn no_retries() -> Self {
        Self::new(1, 1, time::Duration::ZERO, None)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Time to wait after `attempt` (1-based) failed, before trying again.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let exponent = attempt.saturating_sub(1);
        let candidate_interval = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(exponent));

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(200),
            maximum_interval: Some(time::Duration::from_secs(5)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_until_the_cap() {
        let policy = RetryPolicy::new(
            10,
            2,
            time::Duration::from_millis(100),
            Some(time::Duration::from_millis(500)),
        );

        assert_eq!(policy.time_until_next_retry(1), time::Duration::from_millis(100));
        assert_eq!(policy.time_until_next_retry(2), time::Duration::from_millis(200));
        assert_eq!(policy.time_until_next_retry(3), time::Duration::from_millis(400));
        assert_eq!(policy.time_until_next_retry(4), time::Duration::from_millis(500));
        assert_eq!(policy.time_until_next_retry(30), time::Duration::from_millis(500));
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::new(3, 2, time::Duration::from_millis(1), None);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        let once = RetryPolicy::no_retries();
        assert_eq!(once.max_attempts(), 1);
        assert!(!once.should_retry(1));
    }

    #[test]
    fn zero_attempts_means_one() {
        let policy = RetryPolicy::new(0, 2, time::Duration::from_millis(1), None);
        assert_eq!(policy.max_attempts(), 1);
    }
}
