use crate::config::CircuitBreakerConfig;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Failure times within the sampling window, as offsets from the epoch
    failures: Vec<Duration>,
    opened_at: Option<Duration>,
    half_open_admitted: u32,
    half_open_successes: u32,
}

/// Failure-rate circuit breaker for one upstream instance.
///
/// Trips when `failure_threshold` failures land inside the sampling
/// window; stays open for the break duration, then admits a limited
/// number of probes. Probes all succeeding closes the breaker, any
/// probe failing reopens it.
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    epoch: Instant,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(target: String, config: CircuitBreakerConfig) -> Self {
        Self {
            target,
            config,
            epoch: Instant::now(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: Vec::new(),
                opened_at: None,
                half_open_admitted: 0,
                half_open_successes: 0,
            }),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn can_proceed(&self) -> bool {
        self.can_proceed_at(self.epoch.elapsed()).await
    }

    pub(crate) async fn can_proceed_at(&self, now: Duration) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.saturating_sub(at))
                    .unwrap_or(now);
                if elapsed >= self.config.break_duration() {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_admitted = 1;
                    inner.half_open_successes = 0;
                    info!(target = %self.target, "Circuit half-open, probing");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_admitted < self.config.half_open_requests {
                    inner.half_open_admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_requests {
                    inner.state = CircuitState::Closed;
                    inner.failures.clear();
                    inner.opened_at = None;
                    inner.half_open_admitted = 0;
                    inner.half_open_successes = 0;
                    info!(target = %self.target, "Circuit closed");
                }
            }
            CircuitState::Closed => {}
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        self.record_failure_at(self.epoch.elapsed()).await;
    }

    pub(crate) async fn record_failure_at(&self, now: Duration) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.half_open_admitted = 0;
                inner.half_open_successes = 0;
                warn!(target = %self.target, "Probe failed, circuit reopened");
            }
            CircuitState::Closed => {
                let window = self.config.sampling_window();
                inner.failures.retain(|t| *t + window > now);
                inner.failures.push(now);
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        target = %self.target,
                        failures = inner.failures.len(),
                        "Circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }
}

/// One breaker per upstream instance, created lazily
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn breaker(&self, target: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(target.to_string(), self.config.clone()))
            })
            .clone()
    }

    pub async fn can_proceed(&self, target: &str) -> bool {
        self.breaker(target).can_proceed().await
    }

    pub async fn record_success(&self, target: &str) {
        self.breaker(target).record_success().await;
    }

    pub async fn record_failure(&self, target: &str) {
        self.breaker(target).record_failure().await;
    }

    pub async fn open_count(&self) -> usize {
        let mut open = 0;
        for entry in self.breakers.iter() {
            if entry.value().state().await == CircuitState::Open {
                open += 1;
            }
        }
        open
    }
}
