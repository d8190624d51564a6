// Middleware for resilient LLM calls
//
// Provides API key health tracking, circuit breaking and typed retry policy

pub mod api_key_pool;
pub mod circuit_breaker;
pub mod retry;

// Re-export commonly used types
pub use api_key_pool::ApiKeyPool;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{Attempt, RetryPolicy};
