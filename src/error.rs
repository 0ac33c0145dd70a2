use std::fmt;
use std::time::Duration;

use hyper::{Body, Response, StatusCode};
use serde_json::json;
use thiserror::Error;

/// Main error type for the proxy core.
///
/// Every variant maps to an HTTP status via [`GantryError::status_code`];
/// the proxy handler feeds that status to an [`ErrorFormatter`] to produce
/// the response body sent to the client.
#[derive(Error, Debug, Clone)]
pub enum GantryError {
    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The inbound request body could not be read or buffered
    #[error("Body read error: {message}")]
    BodyRead { message: String },

    /// Malformed Authorization header
    #[error("Bad authorization header: {message}")]
    BadAuthHeader { message: String },

    /// Missing or invalid credentials
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// Token bucket rejected the request
    #[error("Rate limit reached: {message}")]
    RateLimited {
        message: String,
        /// Seconds until the next bucket opens, when known
        retry_seconds: Option<i64>,
    },

    /// Connection counter rejected the request
    #[error("Connection limit reached: max is {max}, yours: {current}")]
    ConnectionLimited { max: i64, current: i64 },

    /// Requested more tokens than the bucket can ever hold
    #[error("Requested tokens larger than max tokens")]
    OverCapacity,

    /// The load balancer had nothing to offer
    #[error("No available endpoints: {message}")]
    NoEndpoints { message: String },

    /// Every endpoint was tried and the failover predicate denied another go
    #[error("All endpoints failed")]
    AllEndpointsFailed,

    /// Network level errors talking to an upstream
    #[error("Network error: {message}")]
    Network { message: String },

    /// Dial or response-header timeout
    #[error("Operation timed out after {duration:?}: {operation}")]
    Timeout {
        duration: Duration,
        operation: String,
    },

    /// The control plane returned something we could not interpret
    #[error("Bad control reply: {message}")]
    BadControlReply { message: String },

    /// Logic errors, unknown states
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GantryError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn body_read<S: Into<String>>(message: S) -> Self {
        Self::BodyRead {
            message: message.into(),
        }
    }

    pub fn bad_auth<S: Into<String>>(message: S) -> Self {
        Self::BadAuthHeader {
            message: message.into(),
        }
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn rate_limited<S: Into<String>>(message: S) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_seconds: None,
        }
    }

    pub fn no_endpoints<S: Into<String>>(message: S) -> Self {
        Self::NoEndpoints {
            message: message.into(),
        }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(duration: Duration, operation: S) -> Self {
        Self::Timeout {
            duration,
            operation: operation.into(),
        }
    }

    pub fn bad_control_reply<S: Into<String>>(message: S) -> Self {
        Self::BadControlReply {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for transport-level failures that the failover predicate may
    /// decide to retry on another endpoint.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GantryError::Network { .. } | GantryError::Timeout { .. }
        )
    }

    /// HTTP status the client sees when this error terminates a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GantryError::BodyRead { .. } | GantryError::BadAuthHeader { .. } => {
                StatusCode::BAD_REQUEST
            }
            GantryError::Unauthorized { .. } => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            GantryError::RateLimited { .. } | GantryError::ConnectionLimited { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GantryError::NoEndpoints { .. }
            | GantryError::AllEndpointsFailed
            | GantryError::Network { .. } => StatusCode::BAD_GATEWAY,
            GantryError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GantryError::Config { .. }
            | GantryError::OverCapacity
            | GantryError::BadControlReply { .. }
            | GantryError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type alias for proxy operations
pub type GantryResult<T> = Result<T, GantryError>;

impl From<anyhow::Error> for GantryError {
    fn from(err: anyhow::Error) -> Self {
        GantryError::config(err.to_string())
    }
}

impl From<hyper::Error> for GantryError {
    fn from(err: hyper::Error) -> Self {
        if err.is_timeout() {
            GantryError::timeout(Duration::from_secs(10), "HTTP request")
        } else if err.is_connect() {
            GantryError::network(format!("Connection error: {}", err))
        } else {
            GantryError::network(format!("HTTP error: {}", err))
        }
    }
}

impl From<std::io::Error> for GantryError {
    fn from(err: std::io::Error) -> Self {
        GantryError::body_read(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for GantryError {
    fn from(err: serde_json::Error) -> Self {
        GantryError::bad_control_reply(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for GantryError {
    fn from(err: toml::de::Error) -> Self {
        GantryError::config(format!("TOML parsing error: {}", err))
    }
}

impl From<hyper::http::uri::InvalidUri> for GantryError {
    fn from(err: hyper::http::uri::InvalidUri) -> Self {
        GantryError::config(format!("Invalid URI: {}", err))
    }
}

impl From<hyper::http::Error> for GantryError {
    fn from(err: hyper::http::Error) -> Self {
        GantryError::network(format!("HTTP error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for GantryError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        GantryError::timeout(Duration::from_secs(10), "operation")
    }
}

/// A fully formatted HTTP error, ready to stream to the client.
#[derive(Debug, Clone)]
pub struct HttpError {
    pub status_code: StatusCode,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl HttpError {
    pub fn into_response(self) -> Response<Body> {
        Response::builder()
            .status(self.status_code)
            .header(hyper::header::CONTENT_TYPE, self.content_type)
            .body(Body::from(self.body))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HttpError(code={}, body={})",
            self.status_code,
            String::from_utf8_lossy(&self.body)
        )
    }
}

/// Turns HTTP statuses into response payloads. Pluggable so deployments can
/// brand their error pages; the proxy ships with the JSON formatter.
pub trait ErrorFormatter: Send + Sync {
    fn from_status(&self, status: StatusCode) -> HttpError;

    fn format(&self, err: &GantryError) -> HttpError {
        self.from_status(err.status_code())
    }
}

/// Formats errors as `{"error": "<status text>"}`.
#[derive(Debug, Default)]
pub struct JsonFormatter;

impl ErrorFormatter for JsonFormatter {
    fn from_status(&self, status: StatusCode) -> HttpError {
        let body = json!({
            "error": status.canonical_reason().unwrap_or("Unknown"),
        });
        HttpError {
            status_code: status,
            content_type: "application/json",
            body: serde_json::to_vec(&body).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let body_err = GantryError::body_read("unexpected EOF");
        assert!(matches!(body_err, GantryError::BodyRead { .. }));
        assert_eq!(body_err.to_string(), "Body read error: unexpected EOF");

        let net_err = GantryError::network("connection refused");
        assert!(net_err.is_retryable());
        assert_eq!(net_err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GantryError::rate_limited("x").status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GantryError::ConnectionLimited { max: 1, current: 1 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GantryError::AllEndpointsFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GantryError::timeout(Duration::from_secs(10), "dial").status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GantryError::internal("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_json_formatter() {
        let formatter = JsonFormatter;
        let err = formatter.from_status(StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.status_code, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.content_type, "application/json");
        let parsed: serde_json::Value = serde_json::from_slice(&err.body).unwrap();
        assert_eq!(parsed["error"], "Too Many Requests");
    }
}
