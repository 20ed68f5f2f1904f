use crate::config::{CachePolicy, CachingConfig};
use axum::body::Body;
use axum::response::Response;
use base64::Engine;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache keys longer than this are replaced by a digest.
const KEY_HASH_THRESHOLD: usize = 250;

/// Build the cache key for a request under a policy.
///
/// The key always includes service, method and path; query string,
/// selected header values and the authenticated subject are appended
/// according to the policy so responses are partitioned exactly along
/// the dimensions that affect them.
pub fn cache_key(
    service_id: &str,
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    user: Option<&str>,
    policy: &CachePolicy,
) -> String {
    let mut key = format!(
        "{}:{}:{}",
        service_id.to_ascii_lowercase(),
        method.as_str(),
        path
    );

    if policy.vary_by_query {
        if let Some(q) = query {
            if !q.is_empty() {
                key.push('?');
                key.push_str(q);
            }
        }
    }

    // Sorted so header order on the wire cannot split the cache.
    let mut vary: Vec<&String> = policy.vary_by_headers.iter().collect();
    vary.sort();
    for name in vary {
        let value = headers
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        key.push_str(&format!("|{}={}", name.to_ascii_lowercase(), value));
    }

    if policy.vary_by_user {
        key.push_str(&format!("|user={}", user.unwrap_or("anonymous")));
    }

    if key.len() > KEY_HASH_THRESHOLD {
        let digest = Sha256::digest(key.as_bytes());
        return base64::engine::general_purpose::STANDARD.encode(digest);
    }

    key
}

/// A buffered upstream response held by the cache
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub ttl: Duration,
}

impl CachedResponse {
    /// Rebuild an HTTP response, marking it as served from cache
    pub fn into_response(self) -> Response {
        let mut builder = Response::builder().status(self.status);
        if let Some(headers) = builder.headers_mut() {
            *headers = self.headers;
            headers.insert("X-Cache", http::HeaderValue::from_static("HIT"));
        }
        builder
            .body(Body::from(self.body))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

struct PerEntryTtl;

impl moka::Expiry<String, CachedResponse> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedResponse,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process response cache with per-entry TTLs
pub struct ResponseCache {
    cache: moka::future::Cache<String, CachedResponse>,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(config: &CachingConfig) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(config.max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self {
            cache,
            enabled: config.enabled,
        }
    }

    /// Whether this request can be served from or stored to cache
    pub fn is_cacheable(&self, method: &Method, policy: Option<&CachePolicy>) -> bool {
        self.enabled
            && policy
                .map(|p| p.allows_method(method.as_str()))
                .unwrap_or(false)
    }

    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        self.cache.get(key).await
    }

    /// Store a response; anything outside 2xx is refused
    pub async fn store(
        &self,
        key: String,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        ttl: Duration,
    ) {
        if !status.is_success() {
            debug!(status = %status, "Not caching non-success response");
            return;
        }
        self.cache
            .insert(
                key,
                CachedResponse {
                    status,
                    headers,
                    body,
                    ttl,
                },
            )
            .await;
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Approximate bytes held by cached bodies
    pub fn approximate_size_bytes(&self) -> u64 {
        self.cache
            .iter()
            .map(|(_, v)| v.body.len() as u64)
            .sum()
    }

    #[cfg(test)]
    async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }
}
