mod breaker;
mod retry;

pub use breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use retry::RetryExecutor;
