//! # garden-core: Domain Types for Beer Garden
//!
//! Pure types and rules shared by every component of a garden. Nothing in
//! here touches the network, the database or the file system.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Beer Garden Architecture                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              garden-server (HTTP job surface, main)             │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │     garden-sync (broker transport, router, jobs, user sync)     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ garden-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │ operation │  │   types   │  │   event   │  │ validation│  │   │
//! │  │   │ Operation │  │ Garden    │  │ GardenEvt │  │ patches   │  │   │
//! │  │   │ Outcome   │  │ User/Role │  │ UserUpd.  │  │ job defs  │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 garden-db (document store)                      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] - Operation envelope, kinds, responses and typed failures
//! - [`types`] - Gardens, users, role assignments, remote shadows, jobs
//! - [`event`] - Typed garden events
//! - [`error`] - Domain error types
//! - [`validation`] - Job patch / definition / username checks
//!
//! ## Example Usage
//!
//! ```rust
//! use garden_core::types::{filter_role_assignments, ConnectionType, Garden, RoleAssignment, RoleDomain, User};
//!
//! let mut user = User::new("ada");
//! user.role_assignments.push(RoleAssignment::new("admin", RoleDomain::Global));
//! user.role_assignments.push(RoleAssignment::new("ops", RoleDomain::Garden { name: "b".into() }));
//!
//! let child = Garden::new("child", Some(ConnectionType::Stomp)).with_namespaces(["ns1"]);
//! assert_eq!(filter_role_assignments(&user, &child).role_assignments.len(), 1);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod event;
pub mod operation;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use event::{EventPayload, GardenEvent, UserUpdated};
pub use operation::{
    ErrorKind, ErrorMessage, Operation, OperationKind, Outcome, Response, MODEL_CLASS_ACK,
    MODEL_CLASS_ERROR, MODEL_CLASS_EVENT, MODEL_CLASS_OPERATION, WAIT_TIMEOUT_KWARG,
};
pub use types::{
    filter_role_assignments, ConnectionType, Garden, Job, JobDefinition, JobStatus,
    PatchOperation, PatchRequest, RemoteUser, Role, RoleAssignment, RoleDomain, SyncedUser, User,
};
