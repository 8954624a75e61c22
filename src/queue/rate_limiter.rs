//! Per-key exponential backoff

use std::collections::HashMap;
use std::time::Duration;

/// Delay doubles with every consecutive failure of a key, capped at `max_delay`.
#[derive(Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    failures: HashMap<String, u32>,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: HashMap::new(),
        }
    }

    /// Record a failure and return how long to wait before retrying
    pub fn when(&mut self, key: &str) -> Duration {
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);

        2u32.checked_pow(exp)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    pub fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_cap() {
        let mut rl = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(rl.when("k"), Duration::from_millis(10));
        assert_eq!(rl.when("k"), Duration::from_millis(20));
        assert_eq!(rl.when("k"), Duration::from_millis(40));
        assert_eq!(rl.when("k"), Duration::from_millis(50));
        assert_eq!(rl.num_requeues("k"), 4);
        assert_eq!(rl.when("other"), Duration::from_millis(10));
    }

    #[test]
    fn forget_resets_history() {
        let mut rl = ExponentialBackoff::default();
        rl.when("k");
        rl.when("k");
        rl.forget("k");
        assert_eq!(rl.num_requeues("k"), 0);
        assert_eq!(rl.when("k"), Duration::from_millis(5));
    }

    #[test]
    fn huge_exponents_saturate_at_max() {
        let mut rl = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(1000));
        for _ in 0..100 {
            rl.when("k");
        }
        assert_eq!(rl.when("k"), Duration::from_secs(1000));
    }
}
