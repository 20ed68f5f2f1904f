use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Top-level gateway configuration, loaded from a YAML file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Downstream services the gateway routes to
    #[serde(default)]
    pub services: Vec<TargetServiceConfig>,

    /// Named rate limiting policies referenced by services
    #[serde(default)]
    pub rate_limit_policies: HashMap<String, RateLimitPolicy>,

    /// Named response caching policies referenced by services
    #[serde(default)]
    pub cache_policies: HashMap<String, CachePolicy>,

    /// Named JWT validation policies referenced by services
    #[serde(default)]
    pub auth_policies: HashMap<String, AuthPolicy>,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub caching: CachingConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub hot_reload: HotReloadConfig,
}

/// Server listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Default upstream timeout applied when a service does not set its own
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// A single upstream instance of a target service
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServiceInstance {
    /// Base URL, e.g. "http://10.0.0.5:8080"
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// A routable downstream service
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetServiceConfig {
    /// Identifier clients address the service by (matched case-insensitively)
    pub service_id: String,

    pub instances: Vec<ServiceInstance>,

    #[serde(default)]
    pub load_balancing_strategy: LoadBalancingStrategy,

    /// Allowed HTTP methods; empty means all methods are allowed
    #[serde(default)]
    pub methods: Vec<String>,

    /// Name of a rate limit policy from `rate_limit_policies`
    #[serde(default)]
    pub rate_limit_policy: Option<String>,

    /// Name of a cache policy from `cache_policies`
    #[serde(default)]
    pub cache_policy: Option<String>,

    /// Name of an auth policy from `auth_policies`
    #[serde(default)]
    pub auth_policy: Option<String>,

    /// Per-service upstream timeout override
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl TargetServiceConfig {
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    Random,
    LeastConnections,
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalancingStrategy::RoundRobin => write!(f, "round_robin"),
            LoadBalancingStrategy::WeightedRoundRobin => write!(f, "weighted_round_robin"),
            LoadBalancingStrategy::Random => write!(f, "random"),
            LoadBalancingStrategy::LeastConnections => write!(f, "least_connections"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    #[default]
    SlidingWindow,
    TokenBucket,
    FixedWindow,
}

/// Rate limiting policy shared by every client of the services that reference it
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RateLimitPolicy {
    /// Maximum requests per window, per client
    pub requests_per_window: u32,
    #[serde(default = "default_rate_window_secs")]
    pub window_secs: u64,
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
}

fn default_rate_window_secs() -> u64 {
    60
}

impl RateLimitPolicy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Response caching policy
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CachePolicy {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Methods eligible for caching
    #[serde(default = "default_cache_methods")]
    pub methods: Vec<String>,
    /// Request headers whose values partition the cache
    #[serde(default)]
    pub vary_by_headers: Vec<String>,
    #[serde(default = "default_true")]
    pub vary_by_query: bool,
    /// Partition cached entries by authenticated subject
    #[serde(default)]
    pub vary_by_user: bool,
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_cache_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

fn default_true() -> bool {
    true
}

impl CachePolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// JWT validation policy
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AuthPolicy {
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,
    /// Shared secret for HMAC algorithms
    #[serde(default)]
    pub secret: Option<String>,
    /// PEM-encoded public key for RSA/ECDSA algorithms
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub valid_issuers: Vec<String>,
    #[serde(default)]
    pub valid_audiences: Vec<String>,
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

/// Active health checking configuration, shared by all services
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Probe path appended to each instance address
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub timeout_secs: u64,
    /// Failures in a row before an instance is marked unhealthy
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// A single success within this delay of going unhealthy does not restore the instance
    #[serde(default = "default_unhealthy_retry_delay_secs")]
    pub unhealthy_retry_delay_secs: u64,
    /// Route to any instance when every instance of a service is unhealthy
    #[serde(default)]
    pub fail_open: bool,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_health_timeout_secs() -> u64 {
    5
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_unhealthy_retry_delay_secs() -> u64 {
    60
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_health_path(),
            interval_secs: default_health_interval_secs(),
            timeout_secs: default_health_timeout_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            unhealthy_retry_delay_secs: default_unhealthy_retry_delay_secs(),
            fail_open: false,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn unhealthy_retry_delay(&self) -> Duration {
        Duration::from_secs(self.unhealthy_retry_delay_secs)
    }
}

/// Global response cache settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CachingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum number of cached responses
    #[serde(default = "default_cache_capacity")]
    pub max_entries: u64,
}

fn default_cache_capacity() -> u64 {
    10_000
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_capacity(),
        }
    }
}

/// Upstream forwarding configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Headers stripped from forwarded requests in addition to hop-by-hop headers
    #[serde(default)]
    pub excluded_headers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Additional attempts after the first failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    /// Failures within the sampling window that trip the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_sampling_window_secs")]
    pub sampling_window_secs: u64,
    /// How long the breaker stays open before probing
    #[serde(default = "default_break_secs")]
    pub break_secs: u64,
    /// Probe requests admitted while half-open
    #[serde(default = "default_half_open_requests")]
    pub half_open_requests: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_sampling_window_secs() -> u64 {
    30
}

fn default_break_secs() -> u64 {
    60
}

fn default_half_open_requests() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            sampling_window_secs: default_sampling_window_secs(),
            break_secs: default_break_secs(),
            half_open_requests: default_half_open_requests(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn sampling_window(&self) -> Duration {
        Duration::from_secs(self.sampling_window_secs)
    }

    pub fn break_duration(&self) -> Duration {
        Duration::from_secs(self.break_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HotReloadConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Ignore file events arriving closer together than this
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    1000
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::Config(format!(
                "Failed to read config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Look up a service by id, case-insensitively
    pub fn find_service(&self, service_id: &str) -> Option<&TargetServiceConfig> {
        self.services
            .iter()
            .find(|s| s.service_id.eq_ignore_ascii_case(service_id))
    }

    /// Validate the configuration, rejecting anything the pipeline cannot serve
    pub fn validate(&self) -> Result<()> {
        let mut seen_ids = HashSet::new();

        for service in &self.services {
            if service.service_id.is_empty() {
                return Err(GatewayError::Config(
                    "Service id cannot be empty".to_string(),
                ));
            }
            if !seen_ids.insert(service.service_id.to_ascii_lowercase()) {
                return Err(GatewayError::Config(format!(
                    "Duplicate service id: {}",
                    service.service_id
                )));
            }
            if service.instances.is_empty() {
                return Err(GatewayError::Config(format!(
                    "Service {} has no instances",
                    service.service_id
                )));
            }
            for instance in &service.instances {
                if !instance.address.starts_with("http://")
                    && !instance.address.starts_with("https://")
                {
                    return Err(GatewayError::Config(format!(
                        "Instance address must start with http:// or https://: {}",
                        instance.address
                    )));
                }
                if instance.weight == 0 {
                    return Err(GatewayError::Config(format!(
                        "Instance {} of service {} has zero weight",
                        instance.address, service.service_id
                    )));
                }
            }
            if let Some(name) = &service.rate_limit_policy {
                if !self.rate_limit_policies.contains_key(name) {
                    return Err(GatewayError::Config(format!(
                        "Service {} references unknown rate limit policy: {}",
                        service.service_id, name
                    )));
                }
            }
            if let Some(name) = &service.cache_policy {
                if !self.cache_policies.contains_key(name) {
                    return Err(GatewayError::Config(format!(
                        "Service {} references unknown cache policy: {}",
                        service.service_id, name
                    )));
                }
            }
            if let Some(name) = &service.auth_policy {
                if !self.auth_policies.contains_key(name) {
                    return Err(GatewayError::Config(format!(
                        "Service {} references unknown auth policy: {}",
                        service.service_id, name
                    )));
                }
            }
        }

        for (name, policy) in &self.rate_limit_policies {
            if policy.requests_per_window == 0 {
                return Err(GatewayError::Config(format!(
                    "Rate limit policy {} must allow at least one request per window",
                    name
                )));
            }
            if policy.window_secs == 0 {
                return Err(GatewayError::Config(format!(
                    "Rate limit policy {} has zero window",
                    name
                )));
            }
        }

        for (name, policy) in &self.cache_policies {
            if policy.ttl_secs == 0 {
                return Err(GatewayError::Config(format!(
                    "Cache policy {} has zero TTL",
                    name
                )));
            }
        }

        for (name, policy) in &self.auth_policies {
            let hmac = policy.algorithm.starts_with("HS");
            if hmac && policy.secret.is_none() {
                return Err(GatewayError::Config(format!(
                    "Auth policy {} uses {} but has no secret",
                    name, policy.algorithm
                )));
            }
            if !hmac && policy.public_key.is_none() {
                return Err(GatewayError::Config(format!(
                    "Auth policy {} uses {} but has no public key",
                    name, policy.algorithm
                )));
            }
        }

        if self.health_check.interval_secs == 0 {
            return Err(GatewayError::Config(
                "Health check interval must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Minimal default configuration used by tests and `--init`
    pub fn default_config() -> Self {
        Self {
            server: ServerConfig::default(),
            services: vec![],
            rate_limit_policies: HashMap::new(),
            cache_policies: HashMap::new(),
            auth_policies: HashMap::new(),
            health_check: HealthCheckConfig::default(),
            caching: CachingConfig::default(),
            proxy: ProxyConfig::default(),
            hot_reload: HotReloadConfig::default(),
        }
    }
}
