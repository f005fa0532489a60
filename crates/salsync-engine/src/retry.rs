//! Backoff policies and the clock they sleep on

use async_trait::async_trait;
use salsync_common::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Submission and result-fetch retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_secs: u64,
    pub multiplier: u32,
    pub max_backoff_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_secs: 5,
            multiplier: 2,
            max_backoff_secs: 60,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        grow(
            Duration::from_secs(self.initial_backoff_secs),
            self.multiplier,
            attempt.saturating_sub(1),
            Duration::from_secs(self.max_backoff_secs),
        )
    }
}

/// Job status polling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    pub initial_interval_ms: u64,
    pub multiplier: u32,
    pub max_interval_ms: u64,
    /// Per job poll cycle
    pub timeout_secs: u64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            multiplier: 2,
            max_interval_ms: 30_000,
            timeout_secs: 600,
        }
    }
}

impl PollPolicy {
    /// Wait before poll number `polls` (0-based)
    pub fn interval(&self, polls: u32) -> Duration {
        grow(
            Duration::from_millis(self.initial_interval_ms),
            self.multiplier,
            polls,
            Duration::from_millis(self.max_interval_ms),
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.multiplier == 0 {
            return Err(SyncError::config("poll.multiplier must be at least 1"));
        }
        if self.initial_interval_ms == 0 || self.initial_interval_ms > self.max_interval_ms {
            return Err(SyncError::config(
                "poll.initial_interval_ms must be between 1 and poll.max_interval_ms",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(SyncError::config("poll.timeout_secs must be at least 1"));
        }
        Ok(())
    }
}

fn grow(initial: Duration, multiplier: u32, steps: u32, cap: Duration) -> Duration {
    let factor = multiplier.max(1).saturating_pow(steps);
    initial.saturating_mul(factor).min(cap)
}

/// Time source for job state machines
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Real time through tokio's timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that advances instantly on sleep and remembers each sleep
///
/// Used to drive state machines through long backoffs without waiting.
#[derive(Debug)]
pub struct VirtualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed.lock().map(|e| *e).unwrap_or_default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut elapsed) = self.elapsed.lock() {
            *elapsed += duration;
        }
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}
