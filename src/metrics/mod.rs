use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

/// Prometheus recorder for the raw scrape endpoint
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            GatewayError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();
        info!("Metrics recorder installed");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "gateway_requests_total",
            "Total number of HTTP requests received"
        );
        describe_histogram!(
            "gateway_request_duration_seconds",
            "HTTP request latencies in seconds"
        );
        describe_counter!(
            "gateway_requests_errors_total",
            "Total number of HTTP requests that resulted in errors"
        );

        describe_counter!(
            "gateway_upstream_requests_total",
            "Total number of requests forwarded to upstream instances"
        );
        describe_histogram!(
            "gateway_upstream_duration_seconds",
            "Upstream request latencies in seconds"
        );
        describe_gauge!(
            "gateway_instance_healthy",
            "Instance health status (1 = healthy, 0 = unhealthy)"
        );

        describe_gauge!(
            "gateway_circuit_breaker_state",
            "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)"
        );

        describe_counter!(
            "gateway_rate_limit_exceeded_total",
            "Total number of requests rejected due to rate limiting"
        );

        describe_counter!(
            "gateway_cache_hits_total",
            "Total number of responses served from cache"
        );
        describe_counter!(
            "gateway_cache_misses_total",
            "Total number of cacheable requests that missed the cache"
        );

        describe_counter!(
            "gateway_auth_attempts_total",
            "Total number of authentication attempts"
        );
        describe_counter!(
            "gateway_auth_failures_total",
            "Total number of authentication failures"
        );
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Record a completed inbound request
pub fn record_request(service: &str, method: &str, status: u16, duration: f64) {
    let labels = [
        ("service", service.to_string()),
        ("method", method.to_string()),
        ("status", status.to_string()),
    ];

    counter!("gateway_requests_total", &labels).increment(1);
    histogram!("gateway_request_duration_seconds", &labels).record(duration);

    if status >= 400 {
        counter!("gateway_requests_errors_total", &labels).increment(1);
    }
}

/// Record one attempt against an upstream instance
pub fn record_upstream_request(instance: &str, method: &str, status: u16, duration: f64) {
    let labels = [
        ("instance", instance.to_string()),
        ("method", method.to_string()),
        ("status", status.to_string()),
    ];

    counter!("gateway_upstream_requests_total", &labels).increment(1);
    histogram!("gateway_upstream_duration_seconds", &labels).record(duration);
}

pub fn record_instance_health(service: &str, instance: &str, healthy: bool) {
    let labels = [
        ("service", service.to_string()),
        ("instance", instance.to_string()),
    ];
    gauge!("gateway_instance_healthy", &labels).set(if healthy { 1.0 } else { 0.0 });
}

/// State: 0 = closed, 1 = open, 2 = half-open
pub fn record_circuit_state(instance: &str, state: u8) {
    let labels = [("instance", instance.to_string())];
    gauge!("gateway_circuit_breaker_state", &labels).set(state as f64);
}

pub fn record_rate_limit_exceeded(service: &str, policy: &str) {
    let labels = [
        ("service", service.to_string()),
        ("policy", policy.to_string()),
    ];
    counter!("gateway_rate_limit_exceeded_total", &labels).increment(1);
}

pub fn record_cache_access(service: &str, hit: bool) {
    let labels = [("service", service.to_string())];
    if hit {
        counter!("gateway_cache_hits_total", &labels).increment(1);
    } else {
        counter!("gateway_cache_misses_total", &labels).increment(1);
    }
}

pub fn record_auth_attempt(service: &str, success: bool, reason: &str) {
    let labels = [("service", service.to_string())];
    counter!("gateway_auth_attempts_total", &labels).increment(1);

    if !success {
        let failure_labels = [
            ("service", service.to_string()),
            ("reason", reason.to_string()),
        ];
        counter!("gateway_auth_failures_total", &failure_labels).increment(1);
    }
}

/// Measures one request from arrival to response
pub struct Timer {
    start: Instant,
    service: String,
    method: String,
    instance: Option<String>,
}

impl Timer {
    pub fn new(service: String, method: String) -> Self {
        Self {
            start: Instant::now(),
            service,
            method,
            instance: None,
        }
    }

    pub fn set_instance(&mut self, instance: String) {
        self.instance = Some(instance);
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn record(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();
        record_request(&self.service, &self.method, status, duration);
        if let Some(instance) = &self.instance {
            record_upstream_request(instance, &self.method, status, duration);
        }
    }
}

/// Horizon for "recent" figures: requests per minute and active users.
const RECENT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Sample {
    requests_per_minute: u64,
    average_response_ms: f64,
    cache_hit_rate: f64,
}

/// Rolling aggregate behind the JSON metrics endpoint.
///
/// The Prometheus recorder keeps the raw series; this aggregator keeps
/// just enough state to answer the dashboard snapshot without scraping.
pub struct MetricsAggregator {
    total_requests: AtomicU64,
    client_errors: AtomicU64,
    server_errors: AtomicU64,
    total_duration_micros: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    rate_limited: AtomicU64,
    auth_requests: AtomicU64,
    unroutable: AtomicU64,
    recent_requests: Mutex<VecDeque<Instant>>,
    recent_clients: DashMap<String, Instant>,
    previous: Mutex<Option<Sample>>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            client_errors: AtomicU64::new(0),
            server_errors: AtomicU64::new(0),
            total_duration_micros: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            auth_requests: AtomicU64::new(0),
            unroutable: AtomicU64::new(0),
            recent_requests: Mutex::new(VecDeque::new()),
            recent_clients: DashMap::new(),
            previous: Mutex::new(None),
        }
    }

    pub fn record_request(&self, status: u16, duration: Duration, client_key: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        if (400..500).contains(&status) {
            self.client_errors.fetch_add(1, Ordering::Relaxed);
        } else if status >= 500 {
            self.server_errors.fetch_add(1, Ordering::Relaxed);
        }

        let now = Instant::now();
        let mut recent = self
            .recent_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        recent.push_back(now);
        while let Some(front) = recent.front() {
            if now.duration_since(*front) > RECENT_WINDOW {
                recent.pop_front();
            } else {
                break;
            }
        }
        drop(recent);

        self.recent_clients.insert(client_key.to_string(), now);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_request(&self) {
        self.auth_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A request that found no healthy instance to route to
    pub fn record_unroutable(&self) {
        self.unroutable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(
        &self,
        active_services: usize,
        circuit_breakers_open: usize,
        cache_size_bytes: u64,
    ) -> MetricsSnapshot {
        let now = Instant::now();
        let total = self.total_requests.load(Ordering::Relaxed);
        let client_errors = self.client_errors.load(Ordering::Relaxed);
        let server_errors = self.server_errors.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);

        let requests_per_minute = {
            let mut recent = self
                .recent_requests
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            while let Some(front) = recent.front() {
                if now.duration_since(*front) > RECENT_WINDOW {
                    recent.pop_front();
                } else {
                    break;
                }
            }
            recent.len() as u64
        };

        self.recent_clients
            .retain(|_, seen| now.duration_since(*seen) <= RECENT_WINDOW);
        let active_users = self.recent_clients.len() as u64;

        let average_response_ms = if total > 0 {
            self.total_duration_micros.load(Ordering::Relaxed) as f64 / total as f64 / 1000.0
        } else {
            0.0
        };

        let error_rate = percentage(client_errors + server_errors, total);
        let cache_hit_rate = percentage(hits, hits + misses);
        let uptime = if total > 0 {
            100.0 - percentage(server_errors, total)
        } else {
            100.0
        };
        let lb_efficiency = if total > 0 {
            100.0 - percentage(self.unroutable.load(Ordering::Relaxed), total)
        } else {
            100.0
        };

        // Composite score: availability weighted heaviest, then latency,
        // then cache effectiveness.
        let latency_score = (100.0 - average_response_ms / 10.0).clamp(0.0, 100.0);
        let performance_score = (uptime * 0.5 + latency_score * 0.3 + cache_hit_rate * 0.2)
            .clamp(0.0, 100.0);

        let current = Sample {
            requests_per_minute,
            average_response_ms,
            cache_hit_rate,
        };
        let previous = {
            let mut prev = self.previous.lock().unwrap_or_else(|e| e.into_inner());
            prev.replace(current)
        };

        MetricsSnapshot {
            requests_per_minute,
            average_response_time_ms: round2(average_response_ms),
            cache_hit_rate_percentage: round2(cache_hit_rate),
            rate_limited_requests: self.rate_limited.load(Ordering::Relaxed),
            auth_requests: self.auth_requests.load(Ordering::Relaxed),
            active_users,
            circuit_breakers_open: circuit_breakers_open as u64,
            uptime_percentage: round2(uptime),
            cache_size_mb: round2(cache_size_bytes as f64 / (1024.0 * 1024.0)),
            active_services: active_services as u64,
            overall_performance_score: round2(performance_score),
            load_balancing_efficiency: round2(lb_efficiency),
            error_rate_percentage: round2(error_rate),
            requests_trend: trend(
                previous.map(|p| p.requests_per_minute as f64),
                requests_per_minute as f64,
            ),
            response_time_trend: trend(
                previous.map(|p| p.average_response_ms),
                average_response_ms,
            ),
            cache_hit_trend: trend(previous.map(|p| p.cache_hit_rate), cache_hit_rate),
            timestamp: Utc::now(),
        }
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Direction of change since the previous snapshot, with 5% tolerance
fn trend(previous: Option<f64>, current: f64) -> &'static str {
    let Some(previous) = previous else {
        return "stable";
    };
    if previous == 0.0 {
        return if current > 0.0 { "up" } else { "stable" };
    }
    let change = (current - previous) / previous;
    if change > 0.05 {
        "up"
    } else if change < -0.05 {
        "down"
    } else {
        "stable"
    }
}

/// JSON body of the dashboard metrics endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub requests_per_minute: u64,
    pub average_response_time_ms: f64,
    pub cache_hit_rate_percentage: f64,
    pub rate_limited_requests: u64,
    pub auth_requests: u64,
    pub active_users: u64,
    pub circuit_breakers_open: u64,
    pub uptime_percentage: f64,
    #[serde(rename = "cacheSizeMB")]
    pub cache_size_mb: f64,
    pub active_services: u64,
    pub overall_performance_score: f64,
    pub load_balancing_efficiency: f64,
    pub error_rate_percentage: f64,
    pub requests_trend: &'static str,
    pub response_time_trend: &'static str,
    pub cache_hit_trend: &'static str,
    pub timestamp: DateTime<Utc>,
}
