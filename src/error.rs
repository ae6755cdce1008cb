//! Error types for kirimwa.

use std::time::Duration;

/// Top-level error type for the bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Device store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Device not found: {id}")]
    NotFound { id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[cfg(feature = "postgres")]
    #[error("Pool build error: {0}")]
    PoolBuild(#[from] deadpool_postgres::CreatePoolError),

    #[cfg(feature = "postgres")]
    #[error("Pool runtime error: {0}")]
    PoolRuntime(#[from] deadpool_postgres::PoolError),
}

/// Errors reported by the messaging protocol client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Client is not connected")]
    NotConnected,

    #[error("Request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("Relay rejected {endpoint} with status {status}: {body}")]
    Rejected {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
}

/// Pairing code rendering errors.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Failed to encode QR code: {0}")]
    Encode(String),

    #[error("Failed to write PNG: {0}")]
    Png(String),
}

/// HTTP gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },
}

/// Session lifecycle errors.
///
/// Cloneable so a single transition outcome can be handed to every caller
/// that joined it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Device store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Client already logged in")]
    AlreadySessioned,

    #[error("Pairing code stream closed without producing a code")]
    PairingStreamClosed,

    #[error("No pairing code received within {timeout:?}")]
    PairingTimeout { timeout: Duration },

    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    #[error("Client not initialized")]
    NotConnected,

    #[error("No active client session")]
    NoActiveSession,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("{0}")]
    SendFailure(String),

    #[error("Failed to logout: {0}")]
    LogoutFailure(String),

    #[error("Failed to render pairing code: {0}")]
    Render(String),

    #[error("Session task failed: {0}")]
    Internal(String),
}

impl From<DatabaseError> for SessionError {
    fn from(err: DatabaseError) -> Self {
        SessionError::StoreUnavailable(err.to_string())
    }
}

impl From<RenderError> for SessionError {
    fn from(err: RenderError) -> Self {
        SessionError::Render(err.to_string())
    }
}

/// Result type alias for the bridge.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_missing_env_var_display() {
        let err = ConfigError::MissingEnvVar("DATABASE_URL".to_string());
        assert!(err.to_string().contains("DATABASE_URL"));
        assert!(
            err.to_string()
                .contains("Missing required environment variable")
        );
    }

    #[test]
    fn test_config_error_invalid_value_display() {
        let err = ConfigError::InvalidValue {
            key: "KIRIMWA_SEND_TIMEOUT_SECS".to_string(),
            message: "must be a number".to_string(),
        };
        assert!(err.to_string().contains("KIRIMWA_SEND_TIMEOUT_SECS"));
        assert!(err.to_string().contains("must be a number"));
    }

    #[test]
    fn test_client_error_rejected_display() {
        let err = ClientError::Rejected {
            endpoint: "/v1/messages".to_string(),
            status: 502,
            body: "upstream gone".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/v1/messages"));
        assert!(msg.contains("502"));
        assert!(msg.contains("upstream gone"));
    }

    #[test]
    fn test_session_error_messages_match_http_surface() {
        assert_eq!(
            SessionError::NotConnected.to_string(),
            "Client not initialized"
        );
        assert_eq!(
            SessionError::NoActiveSession.to_string(),
            "No active client session"
        );
        assert_eq!(
            SessionError::LogoutFailure("socket closed".to_string()).to_string(),
            "Failed to logout: socket closed"
        );
        assert_eq!(
            SessionError::SendFailure("server returned error 479".to_string()).to_string(),
            "server returned error 479"
        );
    }

    #[test]
    fn test_pairing_timeout_display() {
        let err = SessionError::PairingTimeout {
            timeout: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn test_database_error_maps_to_store_unavailable() {
        let err = SessionError::from(DatabaseError::Query("connection refused".to_string()));
        match err {
            SessionError::StoreUnavailable(reason) => {
                assert!(reason.contains("connection refused"))
            }
            other => panic!("expected StoreUnavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_error_from_session_error() {
        let err = Error::from(SessionError::AlreadySessioned);
        assert!(err.to_string().contains("Session error"));
    }

    #[test]
    fn test_error_from_config_error() {
        let inner = ConfigError::MissingEnvVar("KIRIMWA_RELAY_URL".to_string());
        let err = Error::from(inner);
        assert!(err.to_string().contains("Configuration error"));
    }
}
