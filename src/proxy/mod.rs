use crate::cache::{cache_key, ResponseCache};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::healthcheck::HealthRegistry;
use crate::loadbalancer::LoadBalancer;
use crate::metrics::{MetricsAggregator, Timer};
use crate::ratelimit::{extract_client_key, RateLimitService};
use crate::resilience::{CircuitBreakerRegistry, RetryExecutor};
use crate::router::{resolve_route, RouteMatch};
use crate::store::PolicyStore;
use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Request, State},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument};

/// Shared handles for the request pipeline
#[derive(Clone)]
pub struct GatewayState {
    pub store: PolicyStore,
    pub registry: Arc<HealthRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub limiter: Arc<RateLimitService>,
    pub cache: Arc<ResponseCache>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub aggregator: Arc<MetricsAggregator>,
    client: reqwest::Client,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::Internal(format!("HTTP client: {}", e)))?;

        let cache = Arc::new(ResponseCache::new(&config.caching));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.proxy.circuit_breaker.clone(),
        ));

        Ok(Self {
            store: PolicyStore::new(config),
            registry: Arc::new(HealthRegistry::new()),
            balancer: Arc::new(LoadBalancer::new()),
            limiter: Arc::new(RateLimitService::new()),
            cache,
            breakers,
            aggregator: Arc::new(MetricsAggregator::new()),
            client,
        })
    }
}

/// `/route/{serviceId}/{path...}`
pub async fn route_handler(
    State(state): State<GatewayState>,
    Path((service_id, downstream)): Path<(String, String)>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    let downstream = format!("/{}", downstream);
    handle(state, service_id, downstream, connect_info.map(|c| c.0), request).await
}

/// `/route/{serviceId}` with no trailing path forwards to the root
pub async fn route_root_handler(
    State(state): State<GatewayState>,
    Path(service_id): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    handle(state, service_id, "/".to_string(), connect_info.map(|c| c.0), request).await
}

/// Fallback surface: the target service id arrives in a header instead
/// of the path, and the full request path is forwarded as-is.
pub async fn header_route_handler(
    State(state): State<GatewayState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    let path = request.uri().path().to_string();
    let service_id = request
        .headers()
        .get("X-Gateway-TargetServiceId")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    match service_id {
        Some(service_id) => {
            handle(state, service_id, path, connect_info.map(|c| c.0), request).await
        }
        None => GatewayError::RouteNotFound(path).into_response(),
    }
}

async fn handle(
    state: GatewayState,
    service_id: String,
    downstream_path: String,
    remote_addr: Option<SocketAddr>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    let client_key = extract_client_key(request.headers(), remote_addr);
    let mut timer = Timer::new(service_id.to_ascii_lowercase(), method.to_string());

    let span = info_span!(
        "gateway_request",
        service = %service_id,
        method = %method,
        path = %downstream_path,
        client = %client_key
    );

    let mut rate_remaining = None;
    let result = process(
        &state,
        &service_id,
        &downstream_path,
        &client_key,
        remote_addr,
        &mut rate_remaining,
        &mut timer,
        request,
    )
    .instrument(span)
    .await;

    let (status, mut response) = match result {
        Ok(response) => (response.status(), response),
        Err(e) => {
            let status = e.status_code();
            if status.is_server_error() {
                warn!(service = %service_id, error = %e, "Request failed");
            } else {
                debug!(service = %service_id, error = %e, "Request rejected");
            }
            (status, e.into_response())
        }
    };
    apply_rate_headers(&mut response, rate_remaining);

    state
        .aggregator
        .record_request(status.as_u16(), timer.elapsed(), &client_key);
    timer.record(status.as_u16());

    response
}

/// The per-request pipeline: resolve, authenticate, rate-limit, select
/// an instance, consult the cache, then proxy with resilience applied.
/// Short-circuits on the first stage that refuses the request.
#[allow(clippy::too_many_arguments)]
async fn process(
    state: &GatewayState,
    service_id: &str,
    downstream_path: &str,
    client_key: &str,
    remote_addr: Option<SocketAddr>,
    rate_remaining: &mut Option<u32>,
    timer: &mut Timer,
    request: Request,
) -> Result<Response> {
    let config = state.store.snapshot().await;
    let method = request.method().clone();
    let query = request.uri().query().map(|q| q.to_string());

    let route = resolve_route(&config, service_id, &method, downstream_path)?;

    let subject = match &route.auth {
        None => None,
        Some((_, policy)) => {
            state.aggregator.record_auth_request();
            match crate::auth::validate_bearer(request.headers(), policy) {
                Ok(ctx) => {
                    crate::metrics::record_auth_attempt(&route.service_id, true, "");
                    ctx.subject
                }
                Err(e) => {
                    let reason = match &e {
                        GatewayError::MissingCredentials => "missing credentials",
                        GatewayError::Unauthorized(msg) => msg.as_str(),
                        _ => "error",
                    };
                    crate::metrics::record_auth_attempt(&route.service_id, false, reason);
                    return Err(e);
                }
            }
        }
    };

    if let Some((policy_name, policy)) = &route.rate_limit {
        let decision = state.limiter.check(client_key, policy_name, policy);
        if !decision.allowed {
            crate::metrics::record_rate_limit_exceeded(&route.service_id, policy_name);
            state.aggregator.record_rate_limited();
            return Err(GatewayError::RateLimited {
                client: client_key.to_string(),
                retry_after_secs: decision.retry_after_secs(),
            });
        }
        *rate_remaining = Some(decision.remaining);
    }

    let instance = match state.balancer.select_instance(
        &route.service_id,
        &route.instances,
        route.strategy,
        &state.registry,
        config.health_check.fail_open,
    ) {
        Ok(instance) => instance,
        Err(e) => {
            state.aggregator.record_unroutable();
            return Err(e);
        }
    };

    let cacheable = state
        .cache
        .is_cacheable(&method, route.cache.as_ref().map(|(_, p)| p));
    let key = if cacheable {
        let (_, policy) = route
            .cache
            .as_ref()
            .ok_or_else(|| GatewayError::Internal("cacheable without policy".to_string()))?;
        Some(cache_key(
            &route.service_id,
            &method,
            downstream_path,
            query.as_deref(),
            request.headers(),
            subject.as_deref(),
            policy,
        ))
    } else {
        None
    };

    if let Some(key) = &key {
        if let Some(hit) = state.cache.get(key).await {
            debug!(key = %key, "Cache hit");
            crate::metrics::record_cache_access(&route.service_id, true);
            state.aggregator.record_cache_hit();
            return Ok(hit.into_response());
        }
        crate::metrics::record_cache_access(&route.service_id, false);
        state.aggregator.record_cache_miss();
    }

    if !state.breakers.can_proceed(&instance.address).await {
        crate::metrics::record_circuit_state(&instance.address, 1);
        return Err(GatewayError::CircuitOpen(instance.address.clone()));
    }

    timer.set_instance(instance.address.clone());
    let (status, headers, body) = forward(
        state,
        &config,
        &route,
        &instance.address,
        &method,
        query.as_deref(),
        client_key,
        remote_addr,
        request,
    )
    .await?;

    if let (Some(key), Some((_, policy))) = (key, &route.cache) {
        state
            .cache
            .store(key, status, headers.clone(), body.clone(), policy.ttl())
            .await;
    }

    let mut response = Response::builder()
        .status(status)
        .body(Body::from(body))
        .map_err(|e| GatewayError::Internal(format!("Response build: {}", e)))?;
    *response.headers_mut() = headers;
    Ok(response)
}

fn apply_rate_headers(response: &mut Response, remaining: Option<u32>) {
    if let Some(remaining) = remaining {
        if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
            response
                .headers_mut()
                .insert("X-RateLimit-Remaining", value);
        }
    }
}

/// Send the request upstream with retry and circuit breaker accounting
#[allow(clippy::too_many_arguments)]
async fn forward(
    state: &GatewayState,
    config: &GatewayConfig,
    route: &RouteMatch,
    address: &str,
    method: &Method,
    query: Option<&str>,
    client_key: &str,
    remote_addr: Option<SocketAddr>,
    request: Request,
) -> Result<(StatusCode, HeaderMap, Bytes)> {
    let mut outbound_headers = filter_headers(request.headers(), &config.proxy.excluded_headers);
    if let Some(addr) = remote_addr {
        append_forwarded_for(&mut outbound_headers, addr);
    }

    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| GatewayError::Internal(format!("Failed to read request body: {}", e)))?;

    let mut url = format!("{}{}", address.trim_end_matches('/'), route.downstream_path);
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }

    let _guard = state.balancer.track(address);
    let executor = RetryExecutor::new(config.proxy.retry.clone());

    let outcome = executor
        .execute(
            || {
                send_request(
                    &state.client,
                    method.clone(),
                    &url,
                    outbound_headers.clone(),
                    body.clone(),
                    route.timeout,
                )
            },
            |e| matches!(e, GatewayError::Upstream(_) | GatewayError::Timeout(_)),
        )
        .await;

    match &outcome {
        Ok((status, _, _)) if status.is_server_error() => {
            state.breakers.record_failure(address).await;
        }
        Ok(_) => {
            state.breakers.record_success(address).await;
            crate::metrics::record_circuit_state(address, 0);
        }
        Err(_) => {
            state.breakers.record_failure(address).await;
        }
    }

    debug!(
        upstream = %url,
        client = %client_key,
        ok = outcome.is_ok(),
        "Upstream call finished"
    );
    outcome
}

async fn send_request(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    headers: HeaderMap,
    body: Bytes,
    timeout: Duration,
) -> Result<(StatusCode, HeaderMap, Bytes)> {
    let response = client
        .request(method, url)
        .headers(headers)
        .body(body)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(url.to_string())
            } else {
                GatewayError::Upstream(e.to_string())
            }
        })?;

    let status = response.status();
    let headers = filter_headers::<&str>(response.headers(), &[]);
    let body = response
        .bytes()
        .await
        .map_err(|e| GatewayError::Upstream(format!("Failed to read upstream body: {}", e)))?;

    Ok((status, headers, body))
}

/// Copy headers minus hop-by-hop and operator-excluded ones
fn filter_headers<E: AsRef<str>>(headers: &HeaderMap, excluded: &[E]) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop_header(name) {
            continue;
        }
        if excluded
            .iter()
            .any(|e| e.as_ref().eq_ignore_ascii_case(name.as_str()))
        {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

fn append_forwarded_for(headers: &mut HeaderMap, addr: SocketAddr) {
    let ip = addr.ip().to_string();
    let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, ip),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_headers_detected() {
        assert!(is_hop_by_hop_header(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop_header(&HeaderName::from_static(
            "transfer-encoding"
        )));
        assert!(is_hop_by_hop_header(&HeaderName::from_static("host")));
        assert!(!is_hop_by_hop_header(&HeaderName::from_static(
            "content-type"
        )));
        assert!(!is_hop_by_hop_header(&HeaderName::from_static(
            "authorization"
        )));
    }

    #[test]
    fn test_filter_headers_drops_excluded() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("x-internal-secret", "shh".parse().unwrap());

        let filtered = filter_headers(&headers, &["X-Internal-Secret"]);
        assert!(filtered.contains_key("content-type"));
        assert!(!filtered.contains_key("connection"));
        assert!(!filtered.contains_key("x-internal-secret"));
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        let addr: SocketAddr = "192.0.2.4:51000".parse().unwrap();
        append_forwarded_for(&mut headers, addr);
        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "203.0.113.9, 192.0.2.4"
        );
    }
}
