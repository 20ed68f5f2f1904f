mod limiter;
mod types;

pub use limiter::RateLimitService;
pub use types::{extract_client_key, RateLimitDecision};
