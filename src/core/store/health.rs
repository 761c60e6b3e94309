//! Circuit breaker guarding access to the local record store.
//!
//! Repeated storage faults (disk full, lock contention past the busy timeout,
//! I/O errors) open the breaker so callers fail fast instead of piling up on a
//! broken database. After the cooldown a single trial call is admitted; its
//! outcome decides whether the breaker closes again.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of the breaker, safe to log or report upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.state == BreakerState::Closed
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    total_failures: u64,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

pub struct StoreHealth {
    config: HealthConfig,
    inner: Mutex<Inner>,
}

impl StoreHealth {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                total_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn admit(&self) -> Result<(), StoreError> {
        self.admit_at(Instant::now())
    }

    pub(crate) fn admit_at(&self, now: Instant) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|at| now.duration_since(at) >= self.config.cooldown);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(StoreError::Unavailable {
                        failures: inner.consecutive_failures,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(StoreError::Unavailable {
                        failures: inner.consecutive_failures,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!(
                "[store] Health restored after {} consecutive failure(s)",
                inner.consecutive_failures
            );
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub(crate) fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.total_failures = inner.total_failures.saturating_add(1);
        inner.trial_in_flight = false;

        let trip = inner.state == BreakerState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;
        if trip {
            if inner.state != BreakerState::Open {
                tracing::warn!(
                    "[store] Circuit opened after {} consecutive failure(s)",
                    inner.consecutive_failures
                );
            }
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
        }
    }

    /// Release a half-open trial slot without judging the store, used when the
    /// trial call failed for reasons unrelated to storage health.
    pub(crate) fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.lock();
        HealthSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned breaker still holds consistent counters.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for StoreHealth {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_secs: u64) -> StoreHealth {
        StoreHealth::new(HealthConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(cooldown_secs),
        })
    }

    #[test]
    fn stays_closed_below_threshold() {
        let health = breaker(3, 10);
        let now = Instant::now();
        health.record_failure_at(now);
        health.record_failure_at(now);
        assert!(health.admit_at(now).is_ok());
        assert_eq!(health.snapshot().state, BreakerState::Closed);
        assert_eq!(health.snapshot().consecutive_failures, 2);
    }

    #[test]
    fn opens_at_threshold_and_rejects_until_cooldown() {
        let health = breaker(2, 10);
        let now = Instant::now();
        health.record_failure_at(now);
        health.record_failure_at(now);
        assert_eq!(health.snapshot().state, BreakerState::Open);

        let err = health.admit_at(now + Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { failures: 2 }));
    }

    #[test]
    fn half_open_admits_single_trial() {
        let health = breaker(1, 10);
        let now = Instant::now();
        health.record_failure_at(now);

        let later = now + Duration::from_secs(11);
        assert!(health.admit_at(later).is_ok());
        assert_eq!(health.snapshot().state, BreakerState::HalfOpen);
        assert!(health.admit_at(later).is_err(), "second trial must wait");
    }

    #[test]
    fn successful_trial_closes_breaker() {
        let health = breaker(1, 10);
        let now = Instant::now();
        health.record_failure_at(now);
        health.admit_at(now + Duration::from_secs(11)).unwrap();
        health.record_success();

        let snap = health.snapshot();
        assert!(snap.is_healthy());
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.total_failures, 1);
    }

    #[test]
    fn failed_trial_reopens_breaker() {
        let health = breaker(3, 10);
        let now = Instant::now();
        for _ in 0..3 {
            health.record_failure_at(now);
        }
        let trial_at = now + Duration::from_secs(11);
        health.admit_at(trial_at).unwrap();
        health.record_failure_at(trial_at);

        assert_eq!(health.snapshot().state, BreakerState::Open);
        assert!(health.admit_at(trial_at + Duration::from_secs(1)).is_err());
    }

    #[test]
    fn released_trial_can_be_retried() {
        let health = breaker(1, 0);
        let now = Instant::now();
        health.record_failure_at(now);
        health.admit_at(now).unwrap();
        health.release_trial();
        assert!(health.admit_at(now).is_ok());
    }
}
