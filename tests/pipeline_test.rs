use axum::routing::any;
use axum::Router;
use http::{Request, StatusCode};
use portico::config::{
    CachePolicy, GatewayConfig, LoadBalancingStrategy, RateLimitAlgorithm, RateLimitPolicy,
    ServiceInstance, TargetServiceConfig,
};
use portico::proxy::{header_route_handler, route_handler, route_root_handler, GatewayState};
use tower::ServiceExt;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

fn service(id: &str, addresses: &[&str]) -> TargetServiceConfig {
    TargetServiceConfig {
        service_id: id.to_string(),
        instances: addresses
            .iter()
            .map(|a| ServiceInstance {
                address: a.to_string(),
                weight: 1,
            })
            .collect(),
        load_balancing_strategy: LoadBalancingStrategy::RoundRobin,
        methods: vec![],
        rate_limit_policy: None,
        cache_policy: None,
        auth_policy: None,
        timeout_secs: None,
    }
}

fn gateway(config: GatewayConfig) -> (Router, GatewayState) {
    let state = GatewayState::new(config).expect("state");
    let app = Router::new()
        .route("/route/:service_id", any(route_root_handler))
        .route("/route/:service_id/*downstream", any(route_handler))
        .fallback(header_route_handler)
        .with_state(state.clone());
    (app, state)
}

fn get(uri: &str) -> Request<axum::body::Body> {
    Request::builder()
        .uri(uri)
        .method("GET")
        .body(axum::body::Body::empty())
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_request_is_proxied_to_backend() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "users": ["Alice", "Bob"]
        })))
        .mount(&backend)
        .await;

    let mut config = GatewayConfig::default_config();
    config.services.push(service("users", &[&backend.uri()]));
    let (app, _) = gateway(config);

    let response = app.oneshot(get("/route/users/api/users")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.contains("Alice"));
}

#[tokio::test]
async fn test_service_id_is_case_insensitive() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;

    let mut config = GatewayConfig::default_config();
    config.services.push(service("Users", &[&backend.uri()]));
    let (app, _) = gateway(config);

    let response = app.oneshot(get("/route/USERS/anything")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_service_is_404() {
    let (app, _) = gateway(GatewayConfig::default_config());
    let response = app.oneshot(get("/route/nope/x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_method_restriction_enforced() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;

    let mut config = GatewayConfig::default_config();
    let mut svc = service("users", &[&backend.uri()]);
    svc.methods = vec!["GET".to_string()];
    config.services.push(svc);
    let (app, _) = gateway(config);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/route/users/api/users")
                .method("DELETE")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_header_based_service_addressing() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/users"))
        .respond_with(ResponseTemplate::new(200).set_body_string("via header"))
        .mount(&backend)
        .await;

    let mut config = GatewayConfig::default_config();
    config.services.push(service("users", &[&backend.uri()]));
    let (app, _) = gateway(config);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/users")
                .method("GET")
                .header("X-Gateway-TargetServiceId", "users")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "via header");
}

#[tokio::test]
async fn test_unroutable_path_without_header_is_404() {
    let (app, _) = gateway(GatewayConfig::default_config());
    let response = app.oneshot(get("/api/users")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_round_robin_spreads_across_instances() {
    let backend_a = MockServer::start().await;
    let backend_b = MockServer::start().await;
    for backend in [&backend_a, &backend_b] {
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(backend)
            .await;
    }

    let mut config = GatewayConfig::default_config();
    config
        .services
        .push(service("users", &[&backend_a.uri(), &backend_b.uri()]));
    let (app, _) = gateway(config);

    for _ in 0..4 {
        let response = app.clone().oneshot(get("/route/users/x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(backend_a.received_requests().await.unwrap().len(), 2);
    assert_eq!(backend_b.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_rate_limit_denies_before_reaching_backend() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;

    let mut config = GatewayConfig::default_config();
    let mut svc = service("users", &[&backend.uri()]);
    svc.rate_limit_policy = Some("tight".to_string());
    config.services.push(svc);
    config.rate_limit_policies.insert(
        "tight".to_string(),
        RateLimitPolicy {
            requests_per_window: 2,
            window_secs: 60,
            algorithm: RateLimitAlgorithm::SlidingWindow,
        },
    );
    let (app, _) = gateway(config);

    let first = app.clone().oneshot(get("/route/users/x")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get("X-RateLimit-Remaining").unwrap(), "1");

    let second = app.clone().oneshot(get("/route/users/x")).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers().get("X-RateLimit-Remaining").unwrap(), "0");

    let third = app.clone().oneshot(get("/route/users/x")).await.unwrap();
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(third.headers().get("X-RateLimit-Remaining").unwrap(), "0");
    assert!(third.headers().contains_key("X-RateLimit-Retry-After"));

    // The denied request never reached the backend.
    assert_eq!(backend.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_all_instances_unhealthy_is_503_without_backend_call() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;

    let mut config = GatewayConfig::default_config();
    config.services.push(service("users", &[&backend.uri()]));
    let (app, state) = gateway(config);

    state.registry.set_healthy("users", &backend.uri(), false);

    let response = app.oneshot(get("/route/users/x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(backend.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_fail_open_routes_despite_unhealthy_instances() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;

    let mut config = GatewayConfig::default_config();
    config.health_check.fail_open = true;
    config.services.push(service("users", &[&backend.uri()]));
    let (app, state) = gateway(config);

    state.registry.set_healthy("users", &backend.uri(), false);

    let response = app.oneshot(get("/route/users/x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_cached_response_skips_backend() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/list"))
        .respond_with(ResponseTemplate::new(200).set_body_string("payload"))
        .mount(&backend)
        .await;

    let mut config = GatewayConfig::default_config();
    let mut svc = service("users", &[&backend.uri()]);
    svc.cache_policy = Some("short".to_string());
    config.services.push(svc);
    config.cache_policies.insert(
        "short".to_string(),
        CachePolicy {
            ttl_secs: 60,
            methods: vec!["GET".to_string()],
            vary_by_headers: vec![],
            vary_by_query: true,
            vary_by_user: false,
        },
    );
    let (app, _) = gateway(config);

    let miss = app.clone().oneshot(get("/route/users/api/list")).await.unwrap();
    assert_eq!(miss.status(), StatusCode::OK);
    assert!(miss.headers().get("X-Cache").is_none());

    let hit = app.clone().oneshot(get("/route/users/api/list")).await.unwrap();
    assert_eq!(hit.status(), StatusCode::OK);
    assert_eq!(hit.headers().get("X-Cache").unwrap(), "HIT");
    assert_eq!(body_string(hit).await, "payload");

    // Only the miss reached the backend.
    assert_eq!(backend.received_requests().await.unwrap().len(), 1);

    // A different query string is a different cache entry.
    let other = app
        .clone()
        .oneshot(get("/route/users/api/list?page=2"))
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::OK);
    assert_eq!(backend.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_error_responses_are_not_cached() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&backend)
        .await;

    let mut config = GatewayConfig::default_config();
    let mut svc = service("users", &[&backend.uri()]);
    svc.cache_policy = Some("short".to_string());
    config.services.push(svc);
    config.cache_policies.insert(
        "short".to_string(),
        CachePolicy {
            ttl_secs: 60,
            methods: vec!["GET".to_string()],
            vary_by_headers: vec![],
            vary_by_query: true,
            vary_by_user: false,
        },
    );
    let (app, _) = gateway(config);

    for _ in 0..2 {
        let response = app.clone().oneshot(get("/route/users/x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    // Both requests reached the backend: nothing was cached.
    assert_eq!(backend.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_post_body_is_forwarded() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/users"))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .mount(&backend)
        .await;

    let mut config = GatewayConfig::default_config();
    config.services.push(service("users", &[&backend.uri()]));
    let (app, _) = gateway(config);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/route/users/api/users")
                .method("POST")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(r#"{"name":"Charlie"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_string(response).await, "created");

    let received = backend.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(String::from_utf8_lossy(&received[0].body).contains("Charlie"));
}

#[tokio::test]
async fn test_auth_policy_guards_service() {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;

    let mut config = GatewayConfig::default_config();
    let mut svc = service("users", &[&backend.uri()]);
    svc.auth_policy = Some("jwt".to_string());
    config.services.push(svc);
    config.auth_policies.insert(
        "jwt".to_string(),
        portico::config::AuthPolicy {
            algorithm: "HS256".to_string(),
            secret: Some("s3cret".to_string()),
            public_key: None,
            valid_issuers: vec![],
            valid_audiences: vec![],
        },
    );
    let (app, _) = gateway(config);

    let denied = app.clone().oneshot(get("/route/users/x")).await.unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(backend.received_requests().await.unwrap().len(), 0);

    #[derive(serde::Serialize)]
    struct Claims {
        sub: String,
        exp: u64,
    }
    let token = encode(
        &Header::default(),
        &Claims {
            sub: "alice".to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as u64,
        },
        &EncodingKey::from_secret(b"s3cret"),
    )
    .unwrap();

    let allowed = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/route/users/x")
                .method("GET")
                .header("authorization", format!("Bearer {}", token))
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unreachable_backend_maps_to_bad_gateway() {
    // Nothing listens on this port; retries exhaust quickly.
    let mut config = GatewayConfig::default_config();
    config.proxy.retry.max_retries = 1;
    config.proxy.retry.initial_backoff_ms = 1;
    config
        .services
        .push(service("users", &["http://127.0.0.1:1"]));
    let (app, _) = gateway(config);

    let response = app.oneshot(get("/route/users/x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_rate_headers_survive_upstream_failure() {
    // The check passed, so the remaining quota is reported even though
    // the proxied call itself comes back as a 502.
    let mut config = GatewayConfig::default_config();
    config.proxy.retry.max_retries = 1;
    config.proxy.retry.initial_backoff_ms = 1;
    let mut svc = service("users", &["http://127.0.0.1:1"]);
    svc.rate_limit_policy = Some("tight".to_string());
    config.services.push(svc);
    config.rate_limit_policies.insert(
        "tight".to_string(),
        RateLimitPolicy {
            requests_per_window: 5,
            window_secs: 60,
            algorithm: RateLimitAlgorithm::SlidingWindow,
        },
    );
    let (app, _) = gateway(config);

    let response = app.oneshot(get("/route/users/x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.headers().get("X-RateLimit-Remaining").unwrap(), "4");
}

#[tokio::test]
async fn test_client_address_appended_to_forwarded_for() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;

    let mut config = GatewayConfig::default_config();
    config.services.push(service("users", &[&backend.uri()]));
    let (app, _) = gateway(config);

    let mut request = get("/route/users/x");
    request
        .headers_mut()
        .insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
    let addr: std::net::SocketAddr = "192.0.2.4:51000".parse().unwrap();
    request
        .extensions_mut()
        .insert(axum::extract::ConnectInfo(addr));

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let received = backend.received_requests().await.unwrap();
    assert_eq!(
        received[0].headers.get("x-forwarded-for").unwrap(),
        "203.0.113.9, 192.0.2.4"
    );
}

#[tokio::test]
async fn test_query_string_is_forwarded() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(wiremock::matchers::query_param("q", "rust"))
        .respond_with(ResponseTemplate::new(200).set_body_string("found"))
        .mount(&backend)
        .await;

    let mut config = GatewayConfig::default_config();
    config.services.push(service("users", &[&backend.uri()]));
    let (app, _) = gateway(config);

    let response = app
        .oneshot(get("/route/users/search?q=rust"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "found");
}
