use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Gateway error types covering the whole request pipeline
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No service registered for id: {0}")]
    RouteNotFound(String),

    #[error("Method not allowed for service {service}: {method}")]
    MethodNotAllowed { service: String, method: String },

    #[error("Referenced policy not found: {0}")]
    PolicyNotFound(String),

    #[error("Rate limit exceeded for client {client}")]
    RateLimited {
        client: String,
        retry_after_secs: u64,
    },

    #[error("No healthy instance available for service: {0}")]
    NoHealthyInstance(String),

    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Upstream request timed out: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Missing authentication credentials")]
    MissingCredentials,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// HTTP status code the error maps to at the gateway edge
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::PolicyNotFound(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NoHealthyInstance(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::MissingCredentials => StatusCode::UNAUTHORIZED,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        let mut response = (status, body).into_response();

        if let GatewayError::RateLimited {
            retry_after_secs, ..
        } = &self
        {
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Remaining", header::HeaderValue::from_static("0"));
            if let Ok(v) = header::HeaderValue::from_str(&retry_after_secs.to_string()) {
                headers.insert("X-RateLimit-Retry-After", v.clone());
                headers.insert(header::RETRY_AFTER, v);
            }
        }

        response
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::RouteNotFound("users".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::MethodNotAllowed {
                service: "users".to_string(),
                method: "DELETE".to_string()
            }
            .status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            GatewayError::RateLimited {
                client: "1.2.3.4".to_string(),
                retry_after_secs: 7
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::NoHealthyInstance("users".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Upstream("connect refused".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Timeout("deadline".to_string()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::MissingCredentials.status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_rate_limited_response_headers() {
        let err = GatewayError::RateLimited {
            client: "1.2.3.4".to_string(),
            retry_after_secs: 12,
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("X-RateLimit-Retry-After").unwrap(),
            "12"
        );
        assert_eq!(response.headers().get("X-RateLimit-Remaining").unwrap(), "0");
    }
}
