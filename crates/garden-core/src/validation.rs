//! # Validation Module
//!
//! Checks that run before any side effect: job patches, job definitions and
//! usernames.
//!
//! ## Patch Validation
//! ```text
//! [{update, /status, "paused"}, {update, /status, "RUNNING"}]
//!      │
//!      ▼  every instruction checked first
//! [Paused, Running]          ← applied in order by the job facade
//!
//! [{update, /status, "paused"}, {update, /status, "STOPPED"}]
//!      │
//!      ▼
//! Err(UnsupportedStatus("STOPPED"))   ← backend never called
//! ```

use serde_json::Value;

use crate::error::ValidationError;
use crate::types::{JobDefinition, JobStatus, PatchRequest, TRIGGER_TYPES};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Job Validators
// =============================================================================

/// Validates every instruction of a job patch and returns the target
/// statuses in order.
///
/// ## Rules
/// - `operation` must be `update`
/// - `path` must be `/status`
/// - `value` must be `PAUSED` or `RUNNING`, any case
/// - at least one instruction
///
/// ## Example
/// ```rust
/// use garden_core::types::{JobStatus, PatchOperation, PatchRequest};
/// use garden_core::validation::validate_patch;
///
/// let patch = PatchRequest { operations: vec![PatchOperation::update_status("paused")] };
/// assert_eq!(validate_patch(&patch).unwrap(), vec![JobStatus::Paused]);
/// ```
pub fn validate_patch(patch: &PatchRequest) -> ValidationResult<Vec<JobStatus>> {
    if patch.operations.is_empty() {
        return Err(ValidationError::Required {
            field: "operations".to_string(),
        });
    }

    patch
        .operations
        .iter()
        .map(|op| {
            if op.operation != "update" {
                return Err(ValidationError::UnsupportedOperation(op.operation.clone()));
            }
            if op.path != "/status" {
                return Err(ValidationError::UnsupportedPath(op.path.clone()));
            }
            status_value(&op.value)
        })
        .collect()
}

fn status_value(value: &Value) -> ValidationResult<JobStatus> {
    match value {
        Value::String(s) => s.parse(),
        other => Err(ValidationError::UnsupportedStatus(other.to_string())),
    }
}

/// Validates a job definition before it reaches the scheduler.
pub fn validate_job_definition(definition: &JobDefinition) -> ValidationResult<()> {
    if definition.name.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "name".to_string(),
        });
    }

    if !TRIGGER_TYPES.contains(&definition.trigger_type.as_str()) {
        return Err(ValidationError::NotAllowed {
            field: "trigger_type".to_string(),
            allowed: TRIGGER_TYPES.iter().map(|t| t.to_string()).collect(),
        });
    }

    if !definition.trigger.is_null() && !definition.trigger.is_object() {
        return Err(ValidationError::InvalidFormat {
            field: "trigger".to_string(),
            reason: "must be an object".to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// User Validators
// =============================================================================

/// Usernames must be non-empty and free of whitespace.
pub fn validate_username(username: &str) -> ValidationResult<()> {
    if username.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "username".to_string(),
        });
    }

    if username.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidFormat {
            field: "username".to_string(),
            reason: "must not contain whitespace".to_string(),
        });
    }

    Ok(())
}
