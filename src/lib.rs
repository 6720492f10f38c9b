// Resilient client core for a hotel-management REST API

pub mod auth;
pub mod cache;
pub mod circuit_breaker;
pub mod client;
pub mod error;
pub mod health;
pub mod mock_transport;
pub mod observer;
pub mod rate_limiter;
pub mod settings;
pub mod telemetry;
pub mod transform;
pub mod transport;

// Re-export key types for convenience
pub use auth::{AuthProvider, StaticTokenProvider, TokenInfo};
pub use cache::{CacheManager, CachePolicy, CacheStats, InvalidationStrategy};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::{ApiClient, ApiResponse, ClientHealth, RequestOptions, ResilientClient};
pub use error::{ApiError, ErrorKind, TransportError};
pub use health::{HealthMonitor, HealthStatus, RequestMetrics};
pub use rate_limiter::RateLimiter;
pub use settings::Settings;
pub use transform::DataTransformer;
