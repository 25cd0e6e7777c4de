//! # Error Types
//!
//! Domain-specific error types for garden-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  garden-core errors (this file)                                        │
//! │  ├── CoreError        - General domain errors                          │
//! │  └── ValidationError  - Well-formed but semantically invalid input     │
//! │                                                                         │
//! │  garden-db errors (separate crate)                                     │
//! │  └── DbError          - Storage failures                               │
//! │                                                                         │
//! │  garden-sync errors (separate crate)                                   │
//! │  └── SyncError        - Parse / Validation / Routing / Remote / Backend│
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → error_message reply   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A serialized payload could not be turned into a domain value.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Operation type string does not name a known kind.
    #[error("Unknown operation type: {0}")]
    UnknownOperation(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before any side effect happens, so a request that fails here has
/// touched neither the scheduler backend nor the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Invalid format (e.g. bad role-assignment domain).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },

    /// Patch `operation` kind other than `update`.
    #[error("Unsupported operation '{0}'")]
    UnsupportedOperation(String),

    /// Patch `path` other than `/status`.
    #[error("Unsupported path value '{0}'")]
    UnsupportedPath(String),

    /// Patch status value other than PAUSED / RUNNING.
    #[error("Unsupported status value '{0}'")]
    UnsupportedStatus(String),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
