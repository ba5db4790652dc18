use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Map an error to its HTTP surface
///
/// Implemented by error types that cross the listener boundary
pub trait HttpError {
    /// HTTP status to surface to the client
    fn status_code(&self) -> StatusCode;

    /// Wire-level error type string
    fn error_type(&self) -> &str;

    /// Message safe to show the client
    fn client_message(&self) -> String;
}

/// Errors that can occur while proxying a request
///
/// The set is closed: every recoverable condition has a documented
/// recovery path and nothing is swallowed silently.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Client sent a malformed or invalid request
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// No binding in the category is currently selectable
    #[error("no eligible binding for category '{category}'")]
    NoEligibleBinding {
        /// Routing category that came up empty
        category: String,
    },

    /// A stage could not translate between schemas
    #[error("transform error in {stage}: {message}")]
    Transform {
        /// Stage that raised the error
        stage: &'static str,
        /// What could not be translated
        message: String,
    },

    /// Upstream rejected our credentials
    #[error("upstream rejected credentials: {0}")]
    Auth(String),

    /// Upstream rate-limited the request
    #[error("upstream rate limit")]
    RateLimit {
        /// Seconds until the limit resets, when advertised
        retry_after: Option<u64>,
    },

    /// Upstream returned an error status
    #[error("upstream error ({status}): {message}")]
    Upstream {
        /// HTTP status from the provider
        status: u16,
        /// Provider error body or summary
        message: String,
    },

    /// Transport-level failure reaching the provider
    #[error("network error: {0}")]
    Network(String),

    /// The provider did not answer within the deadline
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    /// Provider reply carried no usable content
    #[error("upstream returned an empty response")]
    EmptyResponse,

    /// Provider omitted the termination field entirely
    #[error("upstream reply is missing its finish reason")]
    MissingFinishReason,

    /// The client went away; not a fault of the binding
    #[error("request cancelled")]
    Cancelled,

    /// Unexpected internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ProxyError {
    /// Whether retrying the same binding may succeed
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Upstream { status: 500..=599, .. } | Self::Network(_) | Self::Timeout(_)
        )
    }

    /// Whether the condition has a recovery path short of surfacing it
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoEligibleBinding { .. }
                | Self::RateLimit { .. }
                | Self::Upstream { .. }
                | Self::Network(_)
                | Self::Timeout(_)
                | Self::EmptyResponse
        )
    }
}

impl HttpError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NoEligibleBinding { .. } | Self::Network(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Transform { .. } | Self::MissingFinishReason | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Auth(_) | Self::EmptyResponse => StatusCode::BAD_GATEWAY,
            Self::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            // Cancelled never produces a reply; the status is for logs only
            Self::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::BadRequest(_) => "invalid_request_error",
            Self::NoEligibleBinding { .. } => "overloaded_error",
            Self::Transform { .. } => "transform_error",
            Self::Auth(_) => "authentication_error",
            Self::RateLimit { .. } => "rate_limit_error",
            Self::Upstream { .. } => "upstream_error",
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "timeout_error",
            Self::EmptyResponse => "empty_response_error",
            Self::MissingFinishReason => "missing_finish_reason_error",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "an internal error occurred".to_owned(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_5xx_is_retryable() {
        let err = ProxyError::Upstream {
            status: 502,
            message: "bad gateway".to_owned(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn upstream_4xx_is_not_retryable() {
        let err = ProxyError::Upstream {
            status: 404,
            message: "not found".to_owned(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn auth_is_not_retryable() {
        assert!(!ProxyError::Auth("expired key".to_owned()).is_retryable());
    }

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            ProxyError::NoEligibleBinding {
                category: "default".to_owned()
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ProxyError::EmptyResponse.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyError::MissingFinishReason.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyError::Timeout(Duration::from_secs(30)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn internal_message_is_masked() {
        let err = ProxyError::Internal(anyhow::anyhow!("secret detail"));
        assert!(!err.client_message().contains("secret"));
    }
}
