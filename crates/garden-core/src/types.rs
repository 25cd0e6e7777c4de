//! # Domain Types
//!
//! Federation members, users and their role assignments, remote shadows and
//! scheduled jobs.
//!
//! ## Role Relevance
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  An assignment is pushed to garden G when its domain is:                │
//! │                                                                         │
//! │    Global                          → always                            │
//! │    Garden { name }                 → name ∈ G.namespaces               │
//! │    System { namespace }            → namespace ∈ G.namespaces          │
//! │                                                                         │
//! │  Everything else stays home.                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

// =============================================================================
// Garden Types
// =============================================================================

/// How this garden reaches a federation member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionType {
    /// The garden this process is running.
    Local,
    /// Reached through the message broker.
    Stomp,
    /// Reached over HTTP.
    Http,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Local => "LOCAL",
            ConnectionType::Stomp => "STOMP",
            ConnectionType::Http => "HTTP",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LOCAL" => Ok(ConnectionType::Local),
            "STOMP" => Ok(ConnectionType::Stomp),
            "HTTP" => Ok(ConnectionType::Http),
            _ => Err(ValidationError::NotAllowed {
                field: "connection_type".to_string(),
                allowed: vec!["LOCAL".into(), "STOMP".into(), "HTTP".into()],
            }),
        }
    }
}

/// A federation member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Garden {
    /// Unique key.
    pub name: String,

    /// `None` means configured but never connected.
    #[serde(default)]
    pub connection_type: Option<ConnectionType>,

    /// Scope identifiers owned by this garden.
    #[serde(default)]
    pub namespaces: BTreeSet<String>,
}

impl Garden {
    pub fn new(name: impl Into<String>, connection_type: Option<ConnectionType>) -> Self {
        Garden {
            name: name.into(),
            connection_type,
            namespaces: BTreeSet::new(),
        }
    }

    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    /// Connected and not this process.
    pub fn is_remote(&self) -> bool {
        matches!(self.connection_type, Some(kind) if kind != ConnectionType::Local)
    }
}

// =============================================================================
// Roles
// =============================================================================

/// A named role. Permissions ride along for the receiving garden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,

    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Role {
    pub fn named(name: impl Into<String>) -> Self {
        Role {
            name: name.into(),
            permissions: Vec::new(),
        }
    }
}

/// Where a role assignment applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDomain", into = "RawDomain")]
pub enum RoleDomain {
    Global,
    Garden { name: String },
    System { namespace: String },
}

impl RoleDomain {
    /// True if an assignment in this domain should be visible to `garden`.
    pub fn is_relevant_to(&self, garden: &Garden) -> bool {
        match self {
            RoleDomain::Global => true,
            RoleDomain::Garden { name } => garden.namespaces.contains(name),
            RoleDomain::System { namespace } => garden.namespaces.contains(namespace),
        }
    }
}

/// `{"scope": "...", "identifiers": {...}}` as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDomain {
    scope: String,
    #[serde(default)]
    identifiers: BTreeMap<String, String>,
}

impl TryFrom<RawDomain> for RoleDomain {
    type Error = ValidationError;

    fn try_from(raw: RawDomain) -> Result<Self, Self::Error> {
        let mut identifiers = raw.identifiers;
        let mut take = |key: &str| {
            identifiers
                .remove(key)
                .ok_or_else(|| ValidationError::InvalidFormat {
                    field: "domain.identifiers".to_string(),
                    reason: format!("{} scope requires '{}'", raw.scope, key),
                })
        };

        match raw.scope.as_str() {
            "Global" => Ok(RoleDomain::Global),
            "Garden" => Ok(RoleDomain::Garden { name: take("name")? }),
            "System" => Ok(RoleDomain::System {
                namespace: take("namespace")?,
            }),
            _ => Err(ValidationError::NotAllowed {
                field: "domain.scope".to_string(),
                allowed: vec!["Global".into(), "Garden".into(), "System".into()],
            }),
        }
    }
}

impl From<RoleDomain> for RawDomain {
    fn from(domain: RoleDomain) -> Self {
        let (scope, identifiers) = match domain {
            RoleDomain::Global => ("Global", BTreeMap::new()),
            RoleDomain::Garden { name } => ("Garden", BTreeMap::from([("name".to_string(), name)])),
            RoleDomain::System { namespace } => (
                "System",
                BTreeMap::from([("namespace".to_string(), namespace)]),
            ),
        };
        RawDomain {
            scope: scope.to_string(),
            identifiers,
        }
    }
}

/// A role granted within a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub role: Role,
    pub domain: RoleDomain,
}

impl RoleAssignment {
    pub fn new(role: impl Into<String>, domain: RoleDomain) -> Self {
        RoleAssignment {
            role: Role::named(role),
            domain,
        }
    }
}

// =============================================================================
// Users
// =============================================================================

/// A local identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,

    /// Argon2 PHC string. Never the plain password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default)]
    pub role_assignments: Vec<RoleAssignment>,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        User {
            username: username.into(),
            password: None,
            role_assignments: Vec::new(),
        }
    }

    /// Wire form used by sync operations and USER_UPDATED events.
    pub fn to_synced(&self) -> SyncedUser {
        SyncedUser {
            username: self.username.clone(),
            role_assignments: self.role_assignments.clone(),
            hashed_password: None,
        }
    }

    /// Wire form for USER_SYNC pushes. Carries the stored hash so the
    /// receiving garden can keep the same credential.
    pub fn to_synced_with_credential(&self) -> SyncedUser {
        SyncedUser {
            hashed_password: self.password.clone(),
            ..self.to_synced()
        }
    }
}

/// Returns a copy of `user` holding only the assignments relevant to `garden`.
pub fn filter_role_assignments(user: &User, garden: &Garden) -> User {
    User {
        role_assignments: user
            .role_assignments
            .iter()
            .filter(|assignment| assignment.domain.is_relevant_to(garden))
            .cloned()
            .collect(),
        ..user.clone()
    }
}

/// A user as it travels between gardens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedUser {
    pub username: String,

    #[serde(default)]
    pub role_assignments: Vec<RoleAssignment>,

    /// Already-derived credential, stored as is by the importer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashed_password: Option<String>,
}

impl SyncedUser {
    /// Parses one entry of a `serialized_users` list.
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        serde_json::from_value(value.clone()).map_err(|e| ValidationError::InvalidFormat {
            field: "serialized_user".to_string(),
            reason: e.to_string(),
        })
    }
}

/// What a remote garden was last known to hold for one user.
///
/// A cache, never authoritative; rebuilt by running the sync protocol again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUser {
    pub garden: String,
    pub username: String,
    pub role_assignments: Vec<RoleAssignment>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Jobs
// =============================================================================

/// Scheduler-side state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Paused,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "RUNNING",
            JobStatus::Paused => "PAUSED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ValidationError;

    /// Case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RUNNING" => Ok(JobStatus::Running),
            "PAUSED" => Ok(JobStatus::Paused),
            _ => Err(ValidationError::UnsupportedStatus(s.to_string())),
        }
    }
}

/// Trigger kinds the scheduler understands.
pub const TRIGGER_TYPES: [&str; 3] = ["date", "interval", "cron"];

/// What a caller submits to schedule a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub trigger_type: String,

    /// Trigger arguments (e.g. `{"minutes": 5}` for an interval).
    #[serde(default)]
    pub trigger: Value,

    /// The request to submit on every firing.
    #[serde(default)]
    pub request_template: Value,
}

/// A scheduled unit of work as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub trigger_type: String,
    #[serde(default)]
    pub trigger: Value,
    #[serde(default)]
    pub request_template: Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

/// Attribute names a job listing may filter on.
pub const JOB_FILTER_FIELDS: [&str; 4] = ["id", "name", "status", "trigger_type"];

// =============================================================================
// Job Patches
// =============================================================================

/// One `{operation, path, value}` instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub operation: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub value: Value,
}

impl PatchOperation {
    pub fn update_status(value: impl Into<String>) -> Self {
        PatchOperation {
            operation: "update".to_string(),
            path: "/status".to_string(),
            value: Value::String(value.into()),
        }
    }
}

/// An ordered list of patch instructions.
///
/// Accepts `{"operations": [...]}`, a bare list, or a single instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawPatch")]
pub struct PatchRequest {
    pub operations: Vec<PatchOperation>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPatch {
    Wrapped { operations: Vec<PatchOperation> },
    List(Vec<PatchOperation>),
    Single(PatchOperation),
}

impl From<RawPatch> for PatchRequest {
    fn from(raw: RawPatch) -> Self {
        let operations = match raw {
            RawPatch::Wrapped { operations } | RawPatch::List(operations) => operations,
            RawPatch::Single(operation) => vec![operation],
        };
        PatchRequest { operations }
    }
}
