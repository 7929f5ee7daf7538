use rand::Rng;
use repairflow_core::RetryConfig;
use std::time::Duration;

/// Exponential backoff with multiplicative jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 0.0 to 1.0; the delay is stretched by up to this fraction.
    pub jitter_factor: f64,
}

impl Backoff {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms.max(cfg.base_delay_ms)),
            jitter_factor: cfg.jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let capped = base_ms.min(self.max_delay.as_millis() as f64);
        let jitter = if self.jitter_factor > 0.0 {
            rand::thread_rng().gen_range(0.0..self.jitter_factor)
        } else {
            0.0
        };
        Duration::from_millis((capped * (1.0 + jitter)).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let backoff = Backoff {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter_factor: 0.0,
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(backoff.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_factor() {
        let backoff = Backoff {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(1000),
            jitter_factor: 0.25,
        };
        for _ in 0..50 {
            let delay = backoff.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1250));
        }
    }
}
