use http::HeaderMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests the client may still make in the current window
    pub remaining: u32,
    /// How long a denied client should wait before retrying
    pub retry_after: Duration,
    pub limit: u32,
}

impl RateLimitDecision {
    pub fn allowed(remaining: u32, limit: u32) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: Duration::ZERO,
            limit,
        }
    }

    pub fn denied(retry_after: Duration, limit: u32) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after,
            limit,
        }
    }

    pub fn retry_after_secs(&self) -> u64 {
        // Round up so clients never retry a moment too early.
        self.retry_after.as_secs()
            + if self.retry_after.subsec_nanos() > 0 {
                1
            } else {
                0
            }
    }
}

/// Per-client limiter state, one per (client, policy) pair.
///
/// All timestamps are durations since the owning service's epoch.
#[derive(Debug, Default)]
pub(crate) struct ClientState {
    /// Sliding window: accepted request timestamps, oldest first
    pub timestamps: Vec<Duration>,
    /// Token bucket: fractional tokens currently available
    pub tokens: f64,
    pub last_refill: Option<Duration>,
    /// Fixed window: start of the window the count belongs to
    pub window_start: Option<Duration>,
    pub count: u32,
    pub last_access: Duration,
}

/// Identify the client a request should be accounted against.
///
/// Trusts X-Forwarded-For first so limits follow the originating
/// client through intermediate proxies. Header values only count when
/// they parse as an IP address; otherwise a caller could mint a fresh
/// limiter bucket per request by rotating garbage values.
pub fn extract_client_key(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse::<IpAddr>() {
                return ip.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if let Ok(ip) = real_ip.trim().parse::<IpAddr>() {
            return ip.to_string();
        }
    }

    match remote_addr {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "10.0.0.1".parse().unwrap());
        assert_eq!(extract_client_key(&headers, None), "203.0.113.9");
    }

    #[test]
    fn test_real_ip_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.7".parse().unwrap());
        assert_eq!(extract_client_key(&headers, None), "198.51.100.7");
    }

    #[test]
    fn test_remote_addr_fallback() {
        let headers = HeaderMap::new();
        let addr: SocketAddr = "192.0.2.4:51000".parse().unwrap();
        assert_eq!(extract_client_key(&headers, Some(addr)), "192.0.2.4");
    }

    #[test]
    fn test_non_ip_header_values_fall_through() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "definitely-not-an-ip".parse().unwrap());
        headers.insert("x-real-ip", "also; not an ip".parse().unwrap());
        let addr: SocketAddr = "192.0.2.4:51000".parse().unwrap();
        assert_eq!(extract_client_key(&headers, Some(addr)), "192.0.2.4");
        assert_eq!(extract_client_key(&headers, None), "unknown");
    }

    #[test]
    fn test_unknown_when_nothing_available() {
        let headers = HeaderMap::new();
        assert_eq!(extract_client_key(&headers, None), "unknown");
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let decision = RateLimitDecision::denied(Duration::from_millis(1500), 10);
        assert_eq!(decision.retry_after_secs(), 2);
        let exact = RateLimitDecision::denied(Duration::from_secs(3), 10);
        assert_eq!(exact.retry_after_secs(), 3);
    }
}
