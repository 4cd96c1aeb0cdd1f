use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::domain::errors::ApiError;

pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 120;

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Maximum requests per minute across all clients
    pub requests_per_minute: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
        }
    }
}

/// Global rate limiter
pub type GlobalRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

pub fn create_rate_limiter(config: &RateLimiterConfig) -> GlobalRateLimiter {
    let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or_else(|| {
        tracing::warn!(
            default = DEFAULT_REQUESTS_PER_MINUTE,
            "Requests per minute must be non-zero, using default"
        );
        NonZeroU32::MIN.saturating_add(DEFAULT_REQUESTS_PER_MINUTE - 1)
    });
    Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)))
}

/// Middleware to apply rate limiting
pub async fn rate_limit_middleware(
    State(limiter): State<GlobalRateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    match limiter.check() {
        Ok(_) => next.run(request).await,
        Err(_) => {
            tracing::warn!(path = %request.uri().path(), "Rate limit exceeded");
            ApiError::RateLimitExceeded.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = create_rate_limiter(&RateLimiterConfig {
            requests_per_minute: 2,
        });
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }

    #[test]
    fn test_zero_quota_falls_back_to_default() {
        let limiter = create_rate_limiter(&RateLimiterConfig {
            requests_per_minute: 0,
        });
        assert!(limiter.check().is_ok());
    }

    #[test]
    fn test_default_config() {
        assert_eq!(RateLimiterConfig::default().requests_per_minute, 120);
    }
}
