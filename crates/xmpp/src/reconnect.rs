use std::time::Duration;

use rand::Rng;

pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_FIXED_DELAY: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Doubles from `initial` up to `max`.
    Exponential { initial: Duration, max: Duration },
    Fixed(Duration),
    /// A random base of 2..15 seconds, times six after 7 attempts and times
    /// thirty after 13.
    RandomIncreasing,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            initial: INITIAL_RECONNECT_DELAY,
            max: MAX_RECONNECT_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub strategy: BackoffStrategy,
    /// `0` retries forever.
    pub max_attempts: u32,
    /// Spread each delay by up to a fifth in either direction.
    pub jitter: bool,
    random_base: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(BackoffStrategy::default(), 0)
    }
}

impl ReconnectPolicy {
    pub fn new(strategy: BackoffStrategy, max_attempts: u32) -> Self {
        Self {
            strategy,
            max_attempts,
            jitter: true,
            random_base: Duration::from_secs(rand::rng().random_range(2..15)),
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }

    /// Delay before reconnect `attempt`, counting from 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        base.mul_f64(rand::rng().random_range(0.8..=1.2))
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1);
                let factor = 1_u32.checked_shl(shift).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).clamp(initial, max.max(initial))
            }
            BackoffStrategy::Fixed(delay) => delay,
            BackoffStrategy::RandomIncreasing => match attempt {
                0..=7 => self.random_base,
                8..=13 => self.random_base * 6,
                _ => self.random_base * 30,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_is_exponential_and_capped_at_sixty_seconds() {
        let policy = ReconnectPolicy::default().without_jitter();
        let seconds = |attempt| policy.delay(attempt).as_secs();

        assert_eq!(seconds(1), 1);
        assert_eq!(seconds(2), 2);
        assert_eq!(seconds(3), 4);
        assert_eq!(seconds(4), 8);
        assert_eq!(seconds(6), 32);
        assert_eq!(seconds(7), 60);
        assert_eq!(seconds(99), 60);
    }

    #[test]
    fn jitter_stays_within_a_fifth() {
        let policy = ReconnectPolicy::new(BackoffStrategy::Fixed(Duration::from_secs(10)), 0);
        for _ in 0..100 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_secs(8) && delay <= Duration::from_secs(12));
        }
    }

    #[test]
    fn random_increasing_steps_up() {
        let policy = ReconnectPolicy::new(BackoffStrategy::RandomIncreasing, 0).without_jitter();
        let base = policy.delay(1);

        assert!(base >= Duration::from_secs(2) && base < Duration::from_secs(15));
        assert_eq!(policy.delay(7), base);
        assert_eq!(policy.delay(8), base * 6);
        assert_eq!(policy.delay(14), base * 30);
    }

    #[test]
    fn zero_max_attempts_retries_forever() {
        assert!(ReconnectPolicy::default().should_retry(u32::MAX));

        let bounded = ReconnectPolicy::new(BackoffStrategy::default(), 3);
        assert!(bounded.should_retry(3));
        assert!(!bounded.should_retry(4));
    }
}
