//! # Sync Error Types
//!
//! Error types for the federation core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │   Wire taxonomy         │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  Parse                  │ │
//! │  │  InvalidUrl     │  │  Disconnected   │  │  Validation             │ │
//! │  │  ConfigLoad     │  │  Timeout        │  │  Routing                │ │
//! │  │                 │  │  Broker / TLS   │  │  RemoteUnreachable      │ │
//! │  └─────────────────┘  └─────────────────┘  │  Backend / Remote       │ │
//! │                                            └─────────────────────────┘ │
//! │                                                                         │
//! │  Everything maps onto an ErrorKind so it can cross the wire as an      │
//! │  `error_message` reply.                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use thiserror::Error;

use garden_core::{CoreError, ErrorKind, ErrorMessage, ValidationError};
use garden_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Error type covering every failure of the federation core.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid broker URL.
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish the broker session.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Broker session dropped.
    #[error("Disconnected from broker")]
    Disconnected,

    /// Connection or handshake timeout.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// TLS setup or handshake error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Broker answered with an ERROR frame.
    #[error("Broker error: {0}")]
    BrokerError(String),

    // =========================================================================
    // Operation Errors (the wire taxonomy)
    // =========================================================================
    /// Malformed wire payload.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Well-formed but semantically invalid instruction.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Unknown target garden or operation type.
    #[error("Routing error: {0}")]
    Routing(String),

    /// Remote garden's transport is down or its reply never came.
    #[error("Remote garden unreachable: {0}")]
    RemoteUnreachable(String),

    /// Scheduler or store rejected the call.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Requested document does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Failure reported by a remote garden.
    #[error("{0}")]
    Remote(ErrorMessage),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Database query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Garden is shutting down.
    #[error("Garden is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { entity, id } => SyncError::NotFound { entity, id },
            other => SyncError::DatabaseError(other.to_string()),
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(e) => SyncError::Validation(e),
            CoreError::UnknownOperation(kind) => {
                SyncError::Routing(format!("Unknown operation type '{}'", kind))
            }
            CoreError::Malformed(msg) => SyncError::Parse(msg),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Parse(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => SyncError::Disconnected,
            WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => SyncError::TlsError(tls.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<native_tls::Error> for SyncError {
    fn from(err: native_tls::Error) -> Self {
        SyncError::TlsError(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Category this error is reported as on the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Parse(_) => ErrorKind::Parse,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Routing(_) => ErrorKind::Routing,
            SyncError::RemoteUnreachable(_)
            | SyncError::ConnectionFailed(_)
            | SyncError::Disconnected
            | SyncError::Timeout(_) => ErrorKind::RemoteUnreachable,
            SyncError::Backend(_) | SyncError::NotFound { .. } | SyncError::DatabaseError(_) => {
                ErrorKind::Backend
            }
            SyncError::Remote(message) => message.error_type,
            _ => ErrorKind::Internal,
        }
    }

    /// Converts this error into the payload of an `error_message` reply.
    pub fn to_error_message(&self) -> ErrorMessage {
        match self {
            SyncError::Remote(message) => message.clone(),
            other => ErrorMessage::new(other.kind(), other.to_string()),
        }
    }

    /// Returns true if the failed step can be retried.
    ///
    /// ## Retryable Errors
    /// - Connection failures and drops
    /// - Timeouts
    /// - WebSocket protocol hiccups
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout(_)
                | SyncError::WebSocketError(_)
                | SyncError::RemoteUnreachable(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
