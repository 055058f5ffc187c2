use std::time::{Duration, Instant};

use rand::{thread_rng, Rng};

/// Configuration for reconnect delays.
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect. Each further consecutive failure doubles it.
    ///
    /// Defaults to [`BackoffConfig::DEFAULT_INITIAL_DELAY`].
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    ///
    /// Defaults to [`BackoffConfig::DEFAULT_MAX_DELAY`].
    pub max_delay: Duration,
    /// A connection that stays up this long resets the delay to `initial_delay`.
    ///
    /// Defaults to [`BackoffConfig::DEFAULT_RESET_INTERVAL`].
    pub reset_interval: Duration,
    /// Up to this fraction of each delay is randomly taken off, so that many clients do not
    /// reconnect in lockstep.
    ///
    /// Defaults to [`BackoffConfig::DEFAULT_JITTER_RATIO`].
    pub jitter_ratio: f64,
}

impl BackoffConfig {
    /// Default value for [`BackoffConfig::initial_delay`].
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
    /// Default value for [`BackoffConfig::max_delay`].
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
    /// Default value for [`BackoffConfig::reset_interval`].
    pub const DEFAULT_RESET_INTERVAL: Duration = Duration::from_secs(60);
    /// Default value for [`BackoffConfig::jitter_ratio`].
    pub const DEFAULT_JITTER_RATIO: f64 = 0.5;

    pub fn new() -> BackoffConfig {
        BackoffConfig::default()
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> BackoffConfig {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> BackoffConfig {
        self.max_delay = max_delay;
        self
    }

    pub fn with_reset_interval(mut self, reset_interval: Duration) -> BackoffConfig {
        self.reset_interval = reset_interval;
        self
    }

    /// Update the jitter ratio, clamped to `[0, 1]`.
    pub fn with_jitter_ratio(mut self, jitter_ratio: f64) -> BackoffConfig {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }
}

impl Default for BackoffConfig {
    fn default() -> BackoffConfig {
        BackoffConfig {
            initial_delay: BackoffConfig::DEFAULT_INITIAL_DELAY,
            max_delay: BackoffConfig::DEFAULT_MAX_DELAY,
            reset_interval: BackoffConfig::DEFAULT_RESET_INTERVAL,
            jitter_ratio: BackoffConfig::DEFAULT_JITTER_RATIO,
        }
    }
}

/// Tracks consecutive connection failures and hands out the delay before the next attempt.
#[derive(Debug)]
pub(crate) struct Backoff {
    config: BackoffConfig,
    attempts: u32,
    connected_at: Option<Instant>,
}

impl Backoff {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        Backoff {
            config,
            attempts: 0,
            connected_at: None,
        }
    }

    /// Records a successful connection.
    pub(crate) fn connected(&mut self) {
        self.connected_at = Some(Instant::now());
    }

    /// The delay before reconnecting after a failure or disconnect.
    pub(crate) fn next_delay(&mut self) -> Duration {
        self.next_delay_at(Instant::now())
    }

    fn next_delay_at(&mut self, now: Instant) -> Duration {
        if let Some(connected_at) = self.connected_at.take() {
            if now.saturating_duration_since(connected_at) >= self.config.reset_interval {
                self.attempts = 0;
            }
        }

        let delay = self
            .config
            .initial_delay
            .checked_mul(2u32.saturating_pow(self.attempts))
            .map_or(self.config.max_delay, |delay| delay.min(self.config.max_delay));
        self.attempts = self.attempts.saturating_add(1);

        jitter(delay, delay.mul_f64(self.config.jitter_ratio))
    }
}

/// Apply randomized `jitter` to `interval`.
pub(crate) fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn without_jitter() -> BackoffConfig {
        BackoffConfig::new().with_jitter_ratio(0.0)
    }

    #[test]
    fn delay_doubles_up_to_max() {
        let mut backoff = Backoff::new(without_jitter());
        let delays: Vec<_> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn delay_stays_capped_after_many_attempts() {
        let mut backoff = Backoff::new(without_jitter());
        for _ in 0..100 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), BackoffConfig::DEFAULT_MAX_DELAY);
    }

    #[test]
    fn stable_connection_resets_delay() {
        let mut backoff = Backoff::new(without_jitter());
        backoff.next_delay();
        backoff.next_delay();

        let now = Instant::now();
        backoff.connected_at = Some(now);
        assert_eq!(
            backoff.next_delay_at(now + BackoffConfig::DEFAULT_RESET_INTERVAL),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn short_connection_keeps_growing() {
        let mut backoff = Backoff::new(without_jitter());
        backoff.next_delay();

        let now = Instant::now();
        backoff.connected_at = Some(now);
        assert_eq!(
            backoff.next_delay_at(now + Duration::from_secs(1)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn jittered_delay_stays_within_ratio() {
        let mut backoff = Backoff::new(BackoffConfig::new().with_max_delay(Duration::from_secs(8)));
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(8), "{delay:?} must be <= 8s");
        }
        let mut backoff = Backoff::new(BackoffConfig::new());
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(500), "{delay:?} must be >= 500ms");
    }

    #[test]
    fn jitter_ratio_is_clamped() {
        assert_eq!(BackoffConfig::new().with_jitter_ratio(4.0).jitter_ratio, 1.0);
        assert_eq!(BackoffConfig::new().with_jitter_ratio(-1.0).jitter_ratio, 0.0);
    }

    #[test]
    fn jitter_is_subtractive() {
        let interval = Duration::from_secs(30);
        let result = jitter(interval, Duration::from_secs(30));
        assert!(result <= interval, "{result:?} must be <= {interval:?}");
    }

    #[test]
    fn jitter_truncates_to_zero() {
        assert_eq!(jitter(Duration::ZERO, Duration::from_secs(30)), Duration::ZERO);
    }

    #[test]
    fn jitter_works_with_zero_jitter() {
        let interval = Duration::from_secs(30);
        assert_eq!(jitter(interval, Duration::ZERO), interval);
    }
}
