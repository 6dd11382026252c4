//! Per-principal fixed-window request limiting for booking attempts.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Windows kept before stale ones are pruned.
const PRUNE_AT: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    hits: u32,
}

/// Allows at most `max` hits per key in each `window`. `max == 0` disables
/// the limit.
#[derive(Debug)]
pub struct RateLimiter {
    max: u32,
    window: Duration,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        self.max > 0
    }

    /// Count one hit for `key`. `Err` carries the time until its window resets.
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        if !self.is_enabled() {
            return Ok(());
        }
        let now = Instant::now();
        if self.windows.len() >= PRUNE_AT {
            self.windows
                .retain(|_, w| now.duration_since(w.started) < self.window);
        }

        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            hits: 0,
        });
        let w = entry.value_mut();
        if now.duration_since(w.started) >= self.window {
            *w = Window {
                started: now,
                hits: 0,
            };
        }
        if w.hits >= self.max {
            return Err(self.window - now.duration_since(w.started));
        }
        w.hits += 1;
        Ok(())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}
