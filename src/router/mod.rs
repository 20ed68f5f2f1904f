use crate::config::{
    AuthPolicy, CachePolicy, GatewayConfig, LoadBalancingStrategy, RateLimitPolicy,
    ServiceInstance,
};
use crate::error::{GatewayError, Result};
use http::Method;
use std::time::Duration;

/// Everything the pipeline needs to serve a request, resolved up front.
///
/// Policies are cloned out of the snapshot so the match stays coherent
/// even if the configuration is reloaded mid-request.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    /// Canonical service id as configured (not as the client spelled it)
    pub service_id: String,
    /// Path forwarded to the upstream, always starting with '/'
    pub downstream_path: String,
    pub instances: Vec<ServiceInstance>,
    pub strategy: LoadBalancingStrategy,
    pub rate_limit: Option<(String, RateLimitPolicy)>,
    pub cache: Option<(String, CachePolicy)>,
    pub auth: Option<(String, AuthPolicy)>,
    pub timeout: Duration,
}

/// Resolve a service id and method against the current configuration.
///
/// Pure function of the snapshot: the same inputs always produce the
/// same match, and no state is mutated by resolution.
pub fn resolve_route(
    config: &GatewayConfig,
    service_id: &str,
    method: &Method,
    downstream_path: &str,
) -> Result<RouteMatch> {
    let service = config
        .find_service(service_id)
        .ok_or_else(|| GatewayError::RouteNotFound(service_id.to_string()))?;

    if !service.allows_method(method.as_str()) {
        return Err(GatewayError::MethodNotAllowed {
            service: service.service_id.clone(),
            method: method.to_string(),
        });
    }

    let rate_limit = lookup_policy(
        &service.rate_limit_policy,
        &config.rate_limit_policies,
        &service.service_id,
    )?;
    let cache = lookup_policy(
        &service.cache_policy,
        &config.cache_policies,
        &service.service_id,
    )?;
    let auth = lookup_policy(
        &service.auth_policy,
        &config.auth_policies,
        &service.service_id,
    )?;

    let path = if downstream_path.starts_with('/') {
        downstream_path.to_string()
    } else {
        format!("/{}", downstream_path)
    };

    Ok(RouteMatch {
        service_id: service.service_id.clone(),
        downstream_path: path,
        instances: service.instances.clone(),
        strategy: service.load_balancing_strategy,
        rate_limit,
        cache,
        auth,
        timeout: Duration::from_secs(
            service.timeout_secs.unwrap_or(config.server.timeout_secs),
        ),
    })
}

fn lookup_policy<P: Clone>(
    reference: &Option<String>,
    policies: &std::collections::HashMap<String, P>,
    service_id: &str,
) -> Result<Option<(String, P)>> {
    match reference {
        None => Ok(None),
        Some(name) => policies
            .get(name)
            .map(|p| Some((name.clone(), p.clone())))
            .ok_or_else(|| {
                GatewayError::PolicyNotFound(format!("{} (service {})", name, service_id))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateLimitAlgorithm, TargetServiceConfig};

    fn test_config() -> GatewayConfig {
        let mut config = GatewayConfig::default_config();
        config.services.push(TargetServiceConfig {
            service_id: "Users".to_string(),
            instances: vec![ServiceInstance {
                address: "http://10.0.0.1:8080".to_string(),
                weight: 1,
            }],
            load_balancing_strategy: LoadBalancingStrategy::RoundRobin,
            methods: vec!["GET".to_string(), "POST".to_string()],
            rate_limit_policy: Some("standard".to_string()),
            cache_policy: None,
            auth_policy: None,
            timeout_secs: Some(10),
        });
        config.rate_limit_policies.insert(
            "standard".to_string(),
            RateLimitPolicy {
                requests_per_window: 100,
                window_secs: 60,
                algorithm: RateLimitAlgorithm::SlidingWindow,
            },
        );
        config
    }

    #[test]
    fn test_resolution_is_case_insensitive() {
        let config = test_config();
        let m = resolve_route(&config, "users", &Method::GET, "/profile").unwrap();
        assert_eq!(m.service_id, "Users");
        assert_eq!(m.downstream_path, "/profile");
        assert_eq!(m.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_unknown_service_is_not_found() {
        let config = test_config();
        let err = resolve_route(&config, "orders", &Method::GET, "/").unwrap_err();
        assert!(matches!(err, GatewayError::RouteNotFound(_)));
    }

    #[test]
    fn test_disallowed_method_rejected() {
        let config = test_config();
        let err = resolve_route(&config, "users", &Method::DELETE, "/profile").unwrap_err();
        assert!(matches!(err, GatewayError::MethodNotAllowed { .. }));
    }

    #[test]
    fn test_policy_reference_resolved() {
        let config = test_config();
        let m = resolve_route(&config, "users", &Method::GET, "/profile").unwrap();
        let (name, policy) = m.rate_limit.unwrap();
        assert_eq!(name, "standard");
        assert_eq!(policy.requests_per_window, 100);
        assert!(m.cache.is_none());
    }

    #[test]
    fn test_dangling_policy_reference_is_error() {
        let mut config = test_config();
        config.rate_limit_policies.clear();
        let err = resolve_route(&config, "users", &Method::GET, "/").unwrap_err();
        assert!(matches!(err, GatewayError::PolicyNotFound(_)));
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let config = test_config();
        let first = resolve_route(&config, "users", &Method::GET, "/profile").unwrap();
        let second = resolve_route(&config, "users", &Method::GET, "/profile").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_path_gains_leading_slash() {
        let config = test_config();
        let m = resolve_route(&config, "users", &Method::GET, "profile/42").unwrap();
        assert_eq!(m.downstream_path, "/profile/42");
    }
}
