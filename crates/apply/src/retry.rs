//! Bounded polling on `tokio::time`, so paused-clock tests drive it deterministically.

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Result};
use symk8s_core::ProviderConfig;
use tokio::time::{sleep, Instant};

/// Fixed number of attempts with a constant pause between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), interval }
    }

    pub fn from_config(cfg: &ProviderConfig) -> Self {
        Self::new(cfg.retry_count, cfg.retry_interval())
    }

    /// Run `probe` until it yields `true` or attempts run out. Returns whether it succeeded.
    pub async fn poll<F, Fut>(&self, mut probe: F) -> Result<bool>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        for attempt in 1..=self.max_attempts {
            if probe(attempt).await? {
                return Ok(true);
            }
            if attempt < self.max_attempts {
                sleep(self.interval).await;
            }
        }
        Ok(false)
    }
}

/// Polls until a condition holds or a deadline passes; disabled by `noWait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub enabled: bool,
    pub timeout: Duration,
    pub interval: Duration,
}

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

impl Waiter {
    pub fn from_config(cfg: &ProviderConfig) -> Self {
        Self { enabled: !cfg.no_wait, timeout: cfg.timeout, interval: POLL_INTERVAL }
    }

    pub fn disabled() -> Self {
        Self { enabled: false, timeout: Duration::ZERO, interval: POLL_INTERVAL }
    }

    /// The first probe runs immediately; probe errors abort the wait.
    /// A timeout too large for the clock means no deadline at all.
    pub async fn until<F, Fut>(&self, what: &str, mut probe: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        if !self.enabled {
            return Ok(());
        }
        let deadline = Instant::now().checked_add(self.timeout);
        loop {
            if probe().await? {
                return Ok(());
            }
            let next = Instant::now().checked_add(self.interval);
            if let (Some(deadline), Some(next)) = (deadline, next) {
                if next > deadline {
                    bail!("timed out after {:?} waiting for {}", self.timeout, what);
                }
            }
            sleep(self.interval).await;
        }
    }
}
