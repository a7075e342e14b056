use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for Boreas.
#[derive(Error, Debug)]
pub enum AppError {
    /// The scrape queue refused a submission after the backpressure timeout.
    #[error("scrape queue full for source '{source_name}'")]
    QueueFull { source_name: String },

    /// The circuit breaker for a source is open; the call was never made.
    #[error("circuit open for source '{source_name}', retry after {} seconds", .retry_after.as_secs())]
    CircuitOpen {
        source_name: String,
        retry_after: Duration,
    },

    /// Transient parse failure, eligible for delayed retry with backoff.
    #[error("recoverable parse error [{code}]: {message}")]
    RecoverableParse { code: String, message: String },

    /// Parse failure that will not self-heal; routed to the dead-letter queue.
    #[error("unrecoverable parse error [{code}]: {message}")]
    UnrecoverableParse { code: String, message: String },

    /// Structured parse output does not satisfy the versioned contract.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// The generation stage exhausted its time budget.
    #[error("generation timed out after {0} ms")]
    GenerationTimeout(u64),

    /// Both primary and fallback generation failed.
    #[error("generation failed: {0}")]
    GenerationFailure(String),

    /// Rollback target, DLQ id, schedule id, etc. does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// LLM API call failed.
    #[error("LLM error (HTTP {status_code}): {message}")]
    LlmError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// Publishing a draft to a platform failed.
    #[error("publish to '{platform}' failed: {reason}")]
    PublishError { platform: String, reason: String },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Database operation failed.
    #[error("database error: {0}")]
    DatabaseError(String),

    /// JSON serialization/deserialization failed.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("config error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::RecoverableParse { .. }
            | AppError::GenerationTimeout(_)
            | AppError::CircuitOpen { .. }
            | AppError::QueueFull { .. } => true,
            AppError::LlmError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if this error should trip the circuit breaker.
    ///
    /// Validation and logic errors must not open a source's circuit: they
    /// describe the payload, not the upstream's health.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::LlmError {
                status_code,
                retryable,
                ..
            } => *status_code == 429 || *status_code >= 500 || *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("connection")
            }
            _ => false,
        }
    }

    /// Classifies an error for the parse router: recoverable failures are
    /// scheduled for delayed retry, unrecoverable ones go straight to the DLQ.
    pub fn is_recoverable_parse(&self) -> bool {
        match self {
            AppError::RecoverableParse { .. } => true,
            AppError::UnrecoverableParse { .. } | AppError::ContractViolation(_) => false,
            other => other.is_retryable(),
        }
    }

    /// Short stable code used in dead-letter records.
    pub fn parse_error_code(&self) -> String {
        match self {
            AppError::RecoverableParse { code, .. } | AppError::UnrecoverableParse { code, .. } => {
                code.clone()
            }
            AppError::ContractViolation(_) => "contract_validation".to_string(),
            AppError::Timeout(_) => "timeout".to_string(),
            AppError::NetworkError(_) => "network".to_string(),
            AppError::RateLimitExceeded => "rate_limited".to_string(),
            AppError::LlmError { .. } => "llm".to_string(),
            _ => "unexpected".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::RateLimitExceeded.is_retryable());
        assert!(
            AppError::RecoverableParse {
                code: "llm_retryable".into(),
                message: "overloaded".into(),
            }
            .is_retryable()
        );
        assert!(
            !AppError::ContractViolation("missing field: title".into()).is_retryable()
        );
        assert!(
            !AppError::UnrecoverableParse {
                code: "empty_text".into(),
                message: "empty source text".into(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_circuit_tripping() {
        assert!(AppError::RateLimitExceeded.should_trip_circuit());
        assert!(AppError::Timeout(30).should_trip_circuit());
        assert!(
            AppError::LlmError {
                message: "overloaded".into(),
                status_code: 503,
                retryable: true,
            }
            .should_trip_circuit()
        );
        assert!(!AppError::ContractViolation("bad".into()).should_trip_circuit());
        assert!(!AppError::NotFound("version 9".into()).should_trip_circuit());
    }

    #[test]
    fn test_parse_classification() {
        assert!(
            AppError::RecoverableParse {
                code: "llm_retryable".into(),
                message: "".into(),
            }
            .is_recoverable_parse()
        );
        // Transport-level errors bubbling out of a parser backend are
        // transient by definition.
        assert!(AppError::Timeout(10).is_recoverable_parse());
        assert!(!AppError::ContractViolation("bad".into()).is_recoverable_parse());
        assert_eq!(
            AppError::ContractViolation("bad".into()).parse_error_code(),
            "contract_validation"
        );
    }
}
