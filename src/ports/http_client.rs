use async_trait::async_trait;
use hyper::StatusCode;
use thiserror::Error;

use crate::core::exchange::Exchange;

/// Errors raised while delivering an exchange to a backend.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// No destination candidates were set on the exchange
    #[error("no destinations to deliver to")]
    EmptyDestinations,

    /// A destination could not be parsed into a target
    #[error("invalid destination '{0}'")]
    InvalidDestination(String),

    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    #[error("unknown host {0}")]
    UnknownHost(String),

    #[error("connection reset by {0}")]
    ConnectionReset(String),

    #[error("connection to {0} aborted")]
    ConnectionAborted(String),

    /// The peer closed the connection before a complete status line arrived
    #[error("truncated status line from {0}")]
    TruncatedStatusLine(String),

    #[error("timed out after {after:?} talking to {target}")]
    Timeout {
        target: String,
        after: std::time::Duration,
    },

    #[error("TLS failure with {target}: {message}")]
    Tls { target: String, message: String },

    #[error("protocol error with {target}: {message}")]
    Protocol { target: String, message: String },

    #[error("I/O error with {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// The connection manager was shut down
    #[error("connection pool is shut down")]
    PoolShutdown,

    /// A bounded pool had no free slot within the connect timeout
    #[error("no pooled connection available for {0}")]
    PoolExhausted(String),

    /// A CONNECT tunnel was requested but the inbound connection cannot be upgraded
    #[error("cannot open tunnel: {0}")]
    TunnelUnavailable(String),
}

impl HttpClientError {
    /// Configuration errors are fatal and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::EmptyDestinations | Self::InvalidDestination(_) | Self::TunnelUnavailable(_)
        )
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !self.is_configuration() && !matches!(self, Self::PoolShutdown)
    }

    /// Status of the fallback response generated for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::EmptyDestinations | Self::InvalidDestination(_) | Self::TunnelUnavailable(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::PoolShutdown | Self::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for delivering an exchange to its backends
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Deliver the exchange's request to one of its destinations.
    ///
    /// On success the response is attached to the exchange and its destination
    /// list is collapsed to the destination that answered. On failure the last
    /// error seen is returned after retries are exhausted.
    async fn call(&self, exc: &mut Exchange) -> HttpClientResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_not_retried() {
        assert!(!HttpClientError::EmptyDestinations.is_retryable());
        assert!(!HttpClientError::InvalidDestination("x".into()).is_retryable());
        assert!(!HttpClientError::PoolShutdown.is_retryable());
        assert!(HttpClientError::ConnectionRefused("a:1".into()).is_retryable());
        assert!(HttpClientError::TruncatedStatusLine("a:1".into()).is_retryable());
    }

    #[test]
    fn fallback_status_codes() {
        assert_eq!(
            HttpClientError::UnknownHost("nowhere".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            HttpClientError::Timeout {
                target: "a:1".into(),
                after: std::time::Duration::from_secs(1)
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            HttpClientError::EmptyDestinations.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
