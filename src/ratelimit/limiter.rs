use super::types::{ClientState, RateLimitDecision};
use crate::config::{RateLimitAlgorithm, RateLimitPolicy};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Idle states are dropped once they have been untouched this long.
const STATE_RETENTION: Duration = Duration::from_secs(3600);
/// Minimum interval between sweeps of idle state.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// In-process rate limiter.
///
/// State is keyed by (client, policy) so a client's budget against one
/// policy never interferes with its budget against another. All time
/// arithmetic uses durations since the service's creation, which keeps
/// the algorithms deterministic under test.
pub struct RateLimitService {
    states: DashMap<String, ClientState>,
    epoch: Instant,
    last_sweep_secs: AtomicU64,
}

impl Default for RateLimitService {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitService {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
            epoch: Instant::now(),
            last_sweep_secs: AtomicU64::new(0),
        }
    }

    /// Check and account one request for `client_key` under `policy`
    pub fn check(
        &self,
        client_key: &str,
        policy_name: &str,
        policy: &RateLimitPolicy,
    ) -> RateLimitDecision {
        self.check_at(client_key, policy_name, policy, self.epoch.elapsed())
    }

    pub(crate) fn check_at(
        &self,
        client_key: &str,
        policy_name: &str,
        policy: &RateLimitPolicy,
        now: Duration,
    ) -> RateLimitDecision {
        let key = format!("{}:{}", client_key, policy_name);

        let decision = {
            let mut state = self.states.entry(key).or_default();
            state.last_access = now;
            match policy.algorithm {
                RateLimitAlgorithm::SlidingWindow => {
                    check_sliding_window(&mut state, policy, now)
                }
                RateLimitAlgorithm::TokenBucket => check_token_bucket(&mut state, policy, now),
                RateLimitAlgorithm::FixedWindow => check_fixed_window(&mut state, policy, now),
            }
        };

        if !decision.allowed {
            debug!(
                client = client_key,
                policy = policy_name,
                retry_after_secs = decision.retry_after_secs(),
                "Rate limit exceeded"
            );
        }

        self.maybe_sweep(now);
        decision
    }

    pub fn tracked_clients(&self) -> usize {
        self.states.len()
    }

    /// Periodically drop state for clients that have gone quiet
    fn maybe_sweep(&self, now: Duration) {
        let now_secs = now.as_secs();
        let last = self.last_sweep_secs.load(Ordering::Relaxed);
        if now_secs.saturating_sub(last) < SWEEP_INTERVAL.as_secs() {
            return;
        }
        if self
            .last_sweep_secs
            .compare_exchange(last, now_secs, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let before = self.states.len();
        self.states
            .retain(|_, state| now.saturating_sub(state.last_access) < STATE_RETENTION);
        let dropped = before - self.states.len();
        if dropped > 0 {
            debug!(dropped, "Swept idle rate limit state");
        }
    }
}

/// Count requests inside a window trailing `now`; the budget frees up
/// exactly as old requests age past the window edge.
fn check_sliding_window(
    state: &mut ClientState,
    policy: &RateLimitPolicy,
    now: Duration,
) -> RateLimitDecision {
    let window = policy.window();
    state.timestamps.retain(|t| *t + window > now);

    if (state.timestamps.len() as u32) < policy.requests_per_window {
        state.timestamps.push(now);
        let remaining = policy.requests_per_window - state.timestamps.len() as u32;
        RateLimitDecision::allowed(remaining, policy.requests_per_window)
    } else {
        let retry_after = state
            .timestamps
            .first()
            .map(|oldest| (*oldest + window).saturating_sub(now))
            .unwrap_or(window);
        RateLimitDecision::denied(retry_after, policy.requests_per_window)
    }
}

/// Continuous refill at limit/window tokens per second, capped at the
/// limit; each request consumes one whole token.
fn check_token_bucket(
    state: &mut ClientState,
    policy: &RateLimitPolicy,
    now: Duration,
) -> RateLimitDecision {
    let limit = policy.requests_per_window as f64;
    let rate = limit / policy.window().as_secs_f64();

    match state.last_refill {
        None => {
            state.tokens = limit;
        }
        Some(last) => {
            let elapsed = now.saturating_sub(last).as_secs_f64();
            state.tokens = (state.tokens + elapsed * rate).min(limit);
        }
    }
    state.last_refill = Some(now);

    if state.tokens >= 1.0 {
        state.tokens -= 1.0;
        RateLimitDecision::allowed(state.tokens as u32, policy.requests_per_window)
    } else {
        let deficit = 1.0 - state.tokens;
        let retry_after = Duration::from_secs_f64(deficit / rate);
        RateLimitDecision::denied(retry_after, policy.requests_per_window)
    }
}

/// Count requests per window aligned to multiples of the window size;
/// the count resets at each boundary.
fn check_fixed_window(
    state: &mut ClientState,
    policy: &RateLimitPolicy,
    now: Duration,
) -> RateLimitDecision {
    let window = policy.window();
    let index = now.as_nanos() / window.as_nanos().max(1);
    let window_start = Duration::from_nanos((index as u64).saturating_mul(window.as_nanos() as u64));

    if state.window_start != Some(window_start) {
        state.window_start = Some(window_start);
        state.count = 0;
    }

    if state.count < policy.requests_per_window {
        state.count += 1;
        RateLimitDecision::allowed(
            policy.requests_per_window - state.count,
            policy.requests_per_window,
        )
    } else {
        let retry_after = (window_start + window).saturating_sub(now);
        RateLimitDecision::denied(retry_after, policy.requests_per_window)
    }
}
