use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// The number of attempts before giving up, or 0 for no limit.
    pub max_retries: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            max_retries: 0,
        }
    }
}

/// An exponential backoff with jitter.
///
/// The delay is drawn from `[lower, upper)` where both bounds double after every
/// attempt until they reach the maximum delay.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    retries: usize,
    lower: Duration,
    upper: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let lower = config.min_delay;
        let upper = double(config.min_delay, config.max_delay);
        Self {
            config,
            retries: 0,
            lower,
            upper,
        }
    }

    pub fn reset(&mut self) {
        self.retries = 0;
        self.lower = self.config.min_delay;
        self.upper = double(self.config.min_delay, self.config.max_delay);
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Returns whether another attempt is allowed.
    pub fn ongoing(&self) -> bool {
        self.config.max_retries == 0 || self.retries < self.config.max_retries
    }

    pub fn next_delay(&mut self) -> Duration {
        self.retries += 1;
        if self.lower >= self.config.max_delay {
            return self.config.max_delay;
        }
        let mut delay = self.lower;
        if self.upper > self.lower {
            let jitter = rand::rng().random_range(Duration::ZERO..self.upper - self.lower);
            delay += jitter;
        }
        self.lower = double(self.lower, self.config.max_delay);
        self.upper = double(self.upper, self.config.max_delay);
        delay
    }

    /// Sleeps for the next delay. Returns `false` if the token is cancelled first.
    pub async fn wait(&mut self, token: &CancellationToken) -> bool {
        let delay = self.next_delay();
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

fn double(value: Duration, max: Duration) -> Duration {
    std::cmp::min(value.saturating_mul(2), max)
}
