use crate::config::{LoadBalancingStrategy, ServiceInstance};
use crate::error::{GatewayError, Result};
use crate::healthcheck::HealthRegistry;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Instance selector shared across requests.
///
/// Round-robin cursors are keyed per service so a reload that changes
/// one service never perturbs the rotation of another.
#[derive(Default)]
pub struct LoadBalancer {
    cursors: DashMap<String, Arc<AtomicUsize>>,
    in_flight: DashMap<String, Arc<AtomicUsize>>,
}

/// Decrements the in-flight counter for the chosen instance on drop
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick an instance among the healthy ones.
    ///
    /// With `fail_open` set, an all-unhealthy service degrades to
    /// selecting among every configured instance instead of failing.
    pub fn select_instance(
        &self,
        service_id: &str,
        instances: &[ServiceInstance],
        strategy: LoadBalancingStrategy,
        registry: &HealthRegistry,
        fail_open: bool,
    ) -> Result<ServiceInstance> {
        if instances.is_empty() {
            return Err(GatewayError::NoHealthyInstance(service_id.to_string()));
        }

        let healthy: Vec<&ServiceInstance> = instances
            .iter()
            .filter(|i| registry.is_healthy(service_id, &i.address))
            .collect();

        let candidates: Vec<&ServiceInstance> = if !healthy.is_empty() {
            healthy
        } else if fail_open {
            debug!(service = service_id, "All instances unhealthy, failing open");
            instances.iter().collect()
        } else {
            return Err(GatewayError::NoHealthyInstance(service_id.to_string()));
        };

        let selected = match strategy {
            LoadBalancingStrategy::RoundRobin => self.round_robin(service_id, &candidates),
            LoadBalancingStrategy::WeightedRoundRobin => {
                self.weighted_round_robin(service_id, &candidates)
            }
            LoadBalancingStrategy::Random => {
                candidates[rand::thread_rng().gen_range(0..candidates.len())]
            }
            LoadBalancingStrategy::LeastConnections => self.least_connections(&candidates),
        };

        Ok(selected.clone())
    }

    fn cursor(&self, service_id: &str) -> Arc<AtomicUsize> {
        self.cursors
            .entry(service_id.to_ascii_lowercase())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    fn round_robin<'a>(
        &self,
        service_id: &str,
        candidates: &[&'a ServiceInstance],
    ) -> &'a ServiceInstance {
        let n = self.cursor(service_id).fetch_add(1, Ordering::Relaxed);
        candidates[n % candidates.len()]
    }

    /// Round-robin over a virtual list where each instance appears
    /// `weight` times, so relative frequencies match the weights.
    fn weighted_round_robin<'a>(
        &self,
        service_id: &str,
        candidates: &[&'a ServiceInstance],
    ) -> &'a ServiceInstance {
        let total: u64 = candidates.iter().map(|i| i.weight as u64).sum();
        if total == 0 {
            return self.round_robin(service_id, candidates);
        }

        let n = self.cursor(service_id).fetch_add(1, Ordering::Relaxed) as u64;
        let mut slot = n % total;
        for instance in candidates {
            if slot < instance.weight as u64 {
                return instance;
            }
            slot -= instance.weight as u64;
        }
        candidates[candidates.len() - 1]
    }

    fn least_connections<'a>(&self, candidates: &[&'a ServiceInstance]) -> &'a ServiceInstance {
        candidates
            .iter()
            .min_by_key(|i| self.in_flight_count(&i.address))
            .copied()
            .unwrap_or(candidates[0])
    }

    pub fn in_flight_count(&self, address: &str) -> usize {
        self.in_flight
            .get(address)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Register an in-flight request against an instance
    pub fn track(&self, address: &str) -> ConnectionGuard {
        let counter = self
            .in_flight
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard { counter }
    }
}
