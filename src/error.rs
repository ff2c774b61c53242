use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway-boundary error type.
///
/// Covers every failure a client frame can produce. Authentication failures
/// close the connection; authorization and validation failures reject only
/// the offending frame. Consumer-side processing failures never surface
/// here — they are resolved inside the retry pipeline.
#[derive(Error, Debug)]
pub enum GatewayError {
    // ===== Frame-level errors (resolved at the gateway boundary) =====
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("access denied: {0}")]
    Authorization(String),

    #[error("validation failed: {0}")]
    Validation(String),

    // ===== Infrastructure errors =====
    #[error("broker error: {0}")]
    Broker(#[from] crate::broker::BrokerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable code for programmatic error handling on the client
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::Authentication(_) | GatewayError::Jwt(_) => "AUTH_FAILED",
            GatewayError::Authorization(_) => "ACCESS_DENIED",
            GatewayError::Validation(_) => "INVALID_MESSAGE",
            GatewayError::Broker(_) => "BROKER_ERROR",
            GatewayError::Serialization(_) => "SERIALIZATION_ERROR",
            GatewayError::WebSocket(_) => "WEBSOCKET_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error terminates the connection.
    ///
    /// Only a failed CONNECT refuses the connection; rejected SUBSCRIBE/SEND
    /// frames leave the session open and able to send subsequent frames.
    pub fn closes_connection(&self) -> bool {
        matches!(self, GatewayError::Authentication(_) | GatewayError::Jwt(_))
    }

    /// Log this error at the level its class warrants
    pub fn log(&self) {
        match self {
            GatewayError::Authentication(_) | GatewayError::Jwt(_) => {
                tracing::warn!(error = %self, error_code = %self.error_code(), "Authentication failed");
            }
            GatewayError::Authorization(_) | GatewayError::Validation(_) => {
                tracing::debug!(error = %self, error_code = %self.error_code(), "Frame rejected");
            }
            _ => {
                tracing::error!(error = %self, error_code = %self.error_code(), "Server error occurred");
            }
        }
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        GatewayError::Authentication(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        GatewayError::Authorization(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        GatewayError::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        GatewayError::Internal(msg.into())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::WebSocket(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_authentication_closes_the_connection() {
        assert!(GatewayError::authentication("bad token").closes_connection());
        assert!(!GatewayError::authorization("denied").closes_connection());
        assert!(!GatewayError::validation("too long").closes_connection());
        assert!(!GatewayError::internal("oops").closes_connection());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(GatewayError::authentication("x").error_code(), "AUTH_FAILED");
        assert_eq!(GatewayError::authorization("x").error_code(), "ACCESS_DENIED");
        assert_eq!(GatewayError::validation("x").error_code(), "INVALID_MESSAGE");
    }
}
