use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced by the fetch/transform/alert/forecast pipeline.
///
/// Cloneable so that a single in-flight fetch can fan its failure out to
/// every waiter joined on it.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", content = "message")]
pub enum PipelineError {
    #[error("Upstream accounting server unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream payload malformed: {0}")]
    UpstreamMalformed(String),

    #[error("Insufficient history: need at least {required} points, have {available}")]
    InsufficientHistory { required: usize, available: usize },

    #[error("Invalid threshold configuration: {0}")]
    InvalidThresholdConfig(String),

    #[error("Role {role} is not allowed to {operation}")]
    Forbidden { role: String, operation: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl PipelineError {
    /// Short machine-readable discriminator for API bodies and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::UpstreamUnavailable(_) => "upstream_unavailable",
            PipelineError::UpstreamMalformed(_) => "upstream_malformed",
            PipelineError::InsufficientHistory { .. } => "insufficient_history",
            PipelineError::InvalidThresholdConfig(_) => "invalid_threshold_config",
            PipelineError::Forbidden { .. } => "forbidden",
            PipelineError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Whether a caller-side retry has any chance of succeeding
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::UpstreamUnavailable(_))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
