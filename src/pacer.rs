//! Randomized pacing and exponential backoff for loops that hit the upstream platform.
//!
//! The two mechanisms are independent: call [`Pacer::pace`] after every processed item and
//! [`Pacer::backoff`] only when the upstream signals a rate limit (HTTP 429, an empty page).

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::PacerConfig;

pub struct Pacer<R = StdRng> {
    config: PacerConfig,
    rng: R,
    processed: u64,
    since_rest: u32,
    /// Items between long rests; re-drawn after every rest.
    rest_every: u32,
    backoff: Duration,
}

impl Pacer<StdRng> {
    pub fn new(config: PacerConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }
}

impl<R: Rng> Pacer<R> {
    pub fn with_rng(config: PacerConfig, mut rng: R) -> Self {
        let rest_every = draw(&mut rng, config.rest_every[0], config.rest_every[1]).max(1);
        let backoff = Duration::from_millis(config.backoff_base_ms);
        Self {
            config,
            rng,
            processed: 0,
            since_rest: 0,
            rest_every,
            backoff,
        }
    }

    /// Record one processed item and return the pause to insert after it.
    pub fn next_delay(&mut self) -> Duration {
        self.processed += 1;
        if self.processed <= self.config.burst_threshold {
            return Duration::ZERO;
        }

        self.since_rest += 1;
        if self.since_rest >= self.rest_every {
            self.since_rest = 0;
            self.rest_every = draw(
                &mut self.rng,
                self.config.rest_every[0],
                self.config.rest_every[1],
            )
            .max(1);
            let [lo, hi] = self.config.rest_delay_ms;
            let ms = draw(&mut self.rng, lo, hi);
            debug!(processed = self.processed, rest_ms = ms, "pacer rest");
            Duration::from_millis(ms)
        } else {
            let [lo, hi] = self.config.short_delay_ms;
            Duration::from_millis(draw(&mut self.rng, lo, hi))
        }
    }

    /// Sleep for the pause owed after one processed item.
    pub async fn pace(&mut self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Current backoff delay; doubles the next one up to the configured ceiling.
    pub fn backoff(&mut self) -> Duration {
        let delay = self.backoff;
        let ceiling = Duration::from_millis(self.config.backoff_max_ms);
        self.backoff = (self.backoff * 2).min(ceiling);
        delay
    }

    /// Sleep for [`Pacer::backoff`] and return how long was waited.
    pub async fn wait_backoff(&mut self) -> Duration {
        let delay = self.backoff();
        debug!(delay_ms = delay.as_millis() as u64, "backing off");
        tokio::time::sleep(delay).await;
        delay
    }

    pub fn reset_backoff(&mut self) {
        self.backoff = Duration::from_millis(self.config.backoff_base_ms);
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }
}

/// Uniform draw from `[a, b]`, tolerating reversed bounds.
fn draw<R: Rng, T>(rng: &mut R, a: T, b: T) -> T
where
    T: PartialOrd + Copy + rand::distr::uniform::SampleUniform,
{
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    rng.random_range(lo..=hi)
}
