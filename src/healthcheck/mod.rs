use crate::config::HealthCheckConfig;
use crate::error::Result;
use crate::store::PolicyStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Health state tracked per (service, instance) pair
#[derive(Debug, Clone)]
pub struct InstanceHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    /// Time of the most recent failed probe
    pub last_failure: Option<Instant>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for InstanceHealth {
    fn default() -> Self {
        // Instances start healthy so a fresh gateway can route before
        // the first probe cycle completes.
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_failure: None,
            last_checked: None,
            last_error: None,
        }
    }
}

/// Concurrent registry of instance health, shared between the probe
/// loop and the request pipeline.
#[derive(Default)]
pub struct HealthRegistry {
    statuses: DashMap<String, InstanceHealth>,
}

fn registry_key(service_id: &str, address: &str) -> String {
    format!("{}|{}", service_id.to_ascii_lowercase(), address)
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown instances are treated as healthy
    pub fn is_healthy(&self, service_id: &str, address: &str) -> bool {
        self.statuses
            .get(&registry_key(service_id, address))
            .map(|s| s.healthy)
            .unwrap_or(true)
    }

    pub fn status(&self, service_id: &str, address: &str) -> Option<InstanceHealth> {
        self.statuses
            .get(&registry_key(service_id, address))
            .map(|s| s.clone())
    }

    /// Apply a probe outcome.
    ///
    /// A success only restores an unhealthy instance once the retry
    /// delay has passed since the last failed probe; a lone success
    /// inside that window does not flap the instance back to healthy.
    pub fn record_probe(
        &self,
        service_id: &str,
        address: &str,
        success: bool,
        error: Option<String>,
        now: Instant,
        config: &HealthCheckConfig,
    ) -> bool {
        let key = registry_key(service_id, address);
        let mut entry = self.statuses.entry(key).or_default();

        entry.last_checked = Some(Utc::now());

        if success {
            entry.consecutive_failures = 0;
            entry.last_error = None;
            if !entry.healthy {
                let eligible = entry
                    .last_failure
                    .map(|at| now.duration_since(at) >= config.unhealthy_retry_delay())
                    .unwrap_or(true);
                if eligible {
                    entry.healthy = true;
                    entry.last_failure = None;
                    info!(service = service_id, address, "Instance recovered");
                } else {
                    debug!(
                        service = service_id,
                        address, "Probe succeeded inside retry delay, staying unhealthy"
                    );
                }
            }
        } else {
            entry.consecutive_failures += 1;
            entry.last_error = error;
            entry.last_failure = Some(now);
            if entry.healthy && entry.consecutive_failures >= config.max_consecutive_failures {
                entry.healthy = false;
                warn!(
                    service = service_id,
                    address,
                    failures = entry.consecutive_failures,
                    "Instance marked unhealthy"
                );
            }
        }

        entry.healthy
    }

    /// Force an instance's health, used for operational overrides
    pub fn set_healthy(&self, service_id: &str, address: &str, healthy: bool) {
        let key = registry_key(service_id, address);
        let mut entry = self.statuses.entry(key).or_default();
        entry.healthy = healthy;
        if healthy {
            entry.consecutive_failures = 0;
            entry.last_failure = None;
        } else {
            entry.last_failure = Some(Instant::now());
        }
    }

    /// Drop state for instances no longer in the configuration
    pub fn retain_configured(&self, config: &crate::config::GatewayConfig) {
        self.statuses.retain(|key, _| {
            config.services.iter().any(|s| {
                s.instances
                    .iter()
                    .any(|i| registry_key(&s.service_id, &i.address) == *key)
            })
        });
    }
}

/// Per-instance entry in the health report
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceHealthReport {
    pub address: String,
    pub weight: u32,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealthReport {
    pub service_id: String,
    pub load_balancing_strategy: String,
    pub total_instances: usize,
    pub healthy_instances: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_policy: Option<String>,
    pub instances: Vec<InstanceHealthReport>,
}

/// Build the report served on /health-status
pub fn health_report(
    config: &crate::config::GatewayConfig,
    registry: &HealthRegistry,
) -> Vec<ServiceHealthReport> {
    config
        .services
        .iter()
        .map(|service| {
            let instances: Vec<InstanceHealthReport> = service
                .instances
                .iter()
                .map(|instance| {
                    let status = registry
                        .status(&service.service_id, &instance.address)
                        .unwrap_or_default();
                    InstanceHealthReport {
                        address: instance.address.clone(),
                        weight: instance.weight,
                        is_healthy: status.healthy,
                        consecutive_failures: status.consecutive_failures,
                        last_checked: status.last_checked,
                        last_error: status.last_error,
                    }
                })
                .collect();
            let healthy = instances.iter().filter(|i| i.is_healthy).count();
            ServiceHealthReport {
                service_id: service.service_id.clone(),
                load_balancing_strategy: service.load_balancing_strategy.to_string(),
                total_instances: instances.len(),
                healthy_instances: healthy,
                rate_limit_policy: service.rate_limit_policy.clone(),
                cache_policy: service.cache_policy.clone(),
                instances,
            }
        })
        .collect()
}

/// Background prober that drives the registry
pub struct HealthChecker {
    store: PolicyStore,
    registry: Arc<HealthRegistry>,
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new(store: PolicyStore, registry: Arc<HealthRegistry>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| crate::error::GatewayError::Internal(format!("HTTP client: {}", e)))?;
        Ok(Self {
            store,
            registry,
            client,
        })
    }

    /// Probe every configured instance once per interval until shutdown.
    ///
    /// The next deadline is set before the cycle runs, so the period is
    /// the configured interval rather than interval plus probe time, and
    /// the shutdown signal interrupts a cycle that is still in flight.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut next = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                _ = shutdown.changed() => {
                    info!("Health checker stopping");
                    return;
                }
            }

            let config = self.store.snapshot().await;
            next = tokio::time::Instant::now() + config.health_check.interval();

            if config.health_check.enabled {
                tokio::select! {
                    _ = self.probe_cycle(&config) => {}
                    _ = shutdown.changed() => {
                        info!("Health checker stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn probe_cycle(&self, config: &crate::config::GatewayConfig) {
        self.registry.retain_configured(config);

        let probes = config.services.iter().flat_map(|service| {
            service.instances.iter().map(move |instance| {
                self.probe_instance(&service.service_id, &instance.address, &config.health_check)
            })
        });

        futures::future::join_all(probes).await;
    }

    async fn probe_instance(
        &self,
        service_id: &str,
        address: &str,
        config: &HealthCheckConfig,
    ) {
        let url = format!(
            "{}{}",
            address.trim_end_matches('/'),
            config.path
        );

        let outcome = self
            .client
            .get(&url)
            .timeout(config.probe_timeout())
            .send()
            .await;

        let (success, error) = match outcome {
            Ok(response) if response.status().is_success() => (true, None),
            Ok(response) => (false, Some(format!("status {}", response.status()))),
            Err(e) => (false, Some(e.to_string())),
        };

        let healthy = self.registry.record_probe(
            service_id,
            address,
            success,
            error,
            Instant::now(),
            config,
        );
        crate::metrics::record_instance_health(service_id, address, healthy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> HealthCheckConfig {
        HealthCheckConfig {
            max_consecutive_failures: 3,
            unhealthy_retry_delay_secs: 60,
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_instance_is_healthy() {
        let registry = HealthRegistry::new();
        assert!(registry.is_healthy("users", "http://a:1"));
    }

    #[test]
    fn test_marked_unhealthy_after_threshold() {
        let registry = HealthRegistry::new();
        let config = test_config();
        let now = Instant::now();

        for _ in 0..2 {
            registry.record_probe("users", "http://a:1", false, None, now, &config);
            assert!(registry.is_healthy("users", "http://a:1"));
        }
        registry.record_probe("users", "http://a:1", false, None, now, &config);
        assert!(!registry.is_healthy("users", "http://a:1"));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let registry = HealthRegistry::new();
        let config = test_config();
        let now = Instant::now();

        registry.record_probe("users", "http://a:1", false, None, now, &config);
        registry.record_probe("users", "http://a:1", false, None, now, &config);
        registry.record_probe("users", "http://a:1", true, None, now, &config);
        registry.record_probe("users", "http://a:1", false, None, now, &config);
        registry.record_probe("users", "http://a:1", false, None, now, &config);

        // Streak was broken, so five non-consecutive failures never trip it.
        assert!(registry.is_healthy("users", "http://a:1"));
    }

    #[test]
    fn test_recovery_suppressed_inside_retry_delay() {
        let registry = HealthRegistry::new();
        let config = test_config();
        let t0 = Instant::now();

        for _ in 0..3 {
            registry.record_probe("users", "http://a:1", false, None, t0, &config);
        }
        assert!(!registry.is_healthy("users", "http://a:1"));

        // A success 30s after going unhealthy is within the 60s delay.
        let t1 = t0 + Duration::from_secs(30);
        registry.record_probe("users", "http://a:1", true, None, t1, &config);
        assert!(!registry.is_healthy("users", "http://a:1"));

        // A success after the delay restores the instance.
        let t2 = t0 + Duration::from_secs(61);
        registry.record_probe("users", "http://a:1", true, None, t2, &config);
        assert!(registry.is_healthy("users", "http://a:1"));
    }

    #[test]
    fn test_failures_while_unhealthy_keep_counting() {
        let registry = HealthRegistry::new();
        let config = test_config();
        let now = Instant::now();

        for _ in 0..5 {
            registry.record_probe("users", "http://a:1", false, None, now, &config);
        }
        let status = registry.status("users", "http://a:1").unwrap();
        assert!(!status.healthy);
        assert_eq!(status.consecutive_failures, 5);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_probe_cycle() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let mut config = crate::config::GatewayConfig::default_config();
        config.services.push(crate::config::TargetServiceConfig {
            service_id: "users".to_string(),
            instances: vec![crate::config::ServiceInstance {
                address: server.uri(),
                weight: 1,
            }],
            load_balancing_strategy: Default::default(),
            methods: vec![],
            rate_limit_policy: None,
            cache_policy: None,
            auth_policy: None,
            timeout_secs: None,
        });

        let store = PolicyStore::new(config);
        let checker = HealthChecker::new(store, Arc::new(HealthRegistry::new())).unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(checker.run(rx));

        // Let the first cycle start its slow probe, then signal shutdown.
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        // The loop must stop well before the delayed probe would finish.
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("checker kept running after shutdown")
            .unwrap();
    }

    #[test]
    fn test_health_report_shape() {
        let mut config = crate::config::GatewayConfig::default_config();
        config.services.push(crate::config::TargetServiceConfig {
            service_id: "users".to_string(),
            instances: vec![
                crate::config::ServiceInstance {
                    address: "http://a:1".to_string(),
                    weight: 1,
                },
                crate::config::ServiceInstance {
                    address: "http://b:1".to_string(),
                    weight: 1,
                },
            ],
            load_balancing_strategy: Default::default(),
            methods: vec![],
            rate_limit_policy: None,
            cache_policy: None,
            auth_policy: None,
            timeout_secs: None,
        });

        let registry = HealthRegistry::new();
        registry.set_healthy("users", "http://b:1", false);

        let report = health_report(&config, &registry);
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].healthy_instances, 1);
        assert_eq!(report[0].total_instances, 2);
    }
}
