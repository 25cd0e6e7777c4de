//! # Operations and Outcomes
//!
//! The command envelope that travels between gardens, and the two shapes
//! an executed command can come back as.
//!
//! ```text
//! Operation ──► Router ──► handler / remote garden ──► Outcome
//!                                                      ├── Success(Response)
//!                                                      └── Failure(ErrorMessage)
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// `model_class` header value for error replies.
pub const MODEL_CLASS_ERROR: &str = "error_message";

/// `model_class` header value for operation requests.
pub const MODEL_CLASS_OPERATION: &str = "Operation";

/// `model_class` header value for published events.
pub const MODEL_CLASS_EVENT: &str = "Event";

/// `model_class` of a response that carries no payload.
pub const MODEL_CLASS_ACK: &str = "Ack";

/// kwarg that bounds how long the requester waits for a reply.
pub const WAIT_TIMEOUT_KWARG: &str = "wait_timeout";

// =============================================================================
// Operation Kind
// =============================================================================

/// Every operation type this garden knows how to dispatch.
///
/// The wire carries the tag as a string; parsing happens at the router so an
/// unknown tag surfaces as a routing failure rather than a decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    UserSync,
    JobCreate,
    JobRead,
    JobReadAll,
    JobUpdate,
    JobPause,
    JobResume,
    JobDelete,
}

impl OperationKind {
    pub const ALL: [OperationKind; 8] = [
        OperationKind::UserSync,
        OperationKind::JobCreate,
        OperationKind::JobRead,
        OperationKind::JobReadAll,
        OperationKind::JobUpdate,
        OperationKind::JobPause,
        OperationKind::JobResume,
        OperationKind::JobDelete,
    ];

    /// Wire tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::UserSync => "USER_SYNC",
            OperationKind::JobCreate => "JOB_CREATE",
            OperationKind::JobRead => "JOB_READ",
            OperationKind::JobReadAll => "JOB_READ_ALL",
            OperationKind::JobUpdate => "JOB_UPDATE",
            OperationKind::JobPause => "JOB_PAUSE",
            OperationKind::JobResume => "JOB_RESUME",
            OperationKind::JobDelete => "JOB_DELETE",
        }
    }

    /// False for kinds that are published without a `reply-to` and never
    /// awaited by the sender.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, OperationKind::UserSync)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::UnknownOperation(s.to_string()))
    }
}

// =============================================================================
// Operation
// =============================================================================

/// A command envelope routed between gardens or dispatched locally.
///
/// Fields are private: an operation is assembled once through the `with_*`
/// builders and read through accessors afterwards.
///
/// ## Example
/// ```rust
/// use garden_core::{Operation, OperationKind};
///
/// let op = Operation::new(OperationKind::JobPause)
///     .with_target("child")
///     .with_kwarg("job_id", "abc".into());
///
/// assert_eq!(op.target_garden_name(), Some("child"));
/// assert!(!op.is_local_to("parent"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    operation_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_garden_name: Option<String>,

    #[serde(default)]
    args: Vec<Value>,

    #[serde(default)]
    kwargs: Map<String, Value>,
}

impl Operation {
    /// Creates a local operation of the given kind with no arguments.
    pub fn new(kind: OperationKind) -> Self {
        Self::with_type(kind.as_str())
    }

    /// Creates an operation from a raw type tag, known or not.
    pub fn with_type(operation_type: impl Into<String>) -> Self {
        Operation {
            operation_type: operation_type.into(),
            target_garden_name: None,
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_target(mut self, garden: impl Into<String>) -> Self {
        self.target_garden_name = Some(garden.into());
        self
    }

    pub fn with_arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn operation_type(&self) -> &str {
        &self.operation_type
    }

    /// Parses the type tag into a known kind.
    pub fn kind(&self) -> Result<OperationKind, CoreError> {
        self.operation_type.parse()
    }

    /// Target garden, with an empty string treated as "no target".
    pub fn target_garden_name(&self) -> Option<&str> {
        self.target_garden_name
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    /// True when this operation should run on the garden named `local`.
    pub fn is_local_to(&self, local: &str) -> bool {
        match self.target_garden_name() {
            None => true,
            Some(target) => target == local,
        }
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    /// String kwarg lookup, falling back to the first positional argument.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.kwarg(key)
            .and_then(Value::as_str)
            .or_else(|| self.args.first().and_then(Value::as_str))
    }

    /// Reply wait bound, in seconds on the wire.
    ///
    /// Missing, non-numeric, zero or negative values mean "wait forever".
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.kwargs
            .get(WAIT_TIMEOUT_KWARG)
            .and_then(Value::as_f64)
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Returns a copy with the `wait_timeout` kwarg removed.
    pub fn without_wait_timeout(&self) -> Self {
        let mut stripped = self.clone();
        stripped.kwargs.remove(WAIT_TIMEOUT_KWARG);
        stripped
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Wire-visible failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ParseError")]
    Parse,
    #[serde(rename = "ValidationError")]
    Validation,
    #[serde(rename = "RoutingError")]
    Routing,
    #[serde(rename = "RemoteUnreachableError")]
    RemoteUnreachable,
    #[serde(rename = "BackendError")]
    Backend,
    #[serde(rename = "InternalError")]
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Parse => "ParseError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Routing => "RoutingError",
            ErrorKind::RemoteUnreachable => "RemoteUnreachableError",
            ErrorKind::Backend => "BackendError",
            ErrorKind::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

/// Successful result of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub model_class: String,
    pub payload: Value,
}

impl Response {
    pub fn new(model_class: impl Into<String>, payload: Value) -> Self {
        Response {
            model_class: model_class.into(),
            payload,
        }
    }

    /// Response with nothing to report.
    pub fn ack() -> Self {
        Response::new(MODEL_CLASS_ACK, Value::Null)
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_null()
    }
}

/// Typed failure with a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error_type: ErrorKind,
    pub message: String,
}

impl ErrorMessage {
    pub fn new(error_type: ErrorKind, message: impl Into<String>) -> Self {
        ErrorMessage {
            error_type,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

/// Either a success payload or a typed failure. Never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Response),
    Failure(ErrorMessage),
}

impl Outcome {
    pub fn model_class(&self) -> &str {
        match self {
            Outcome::Success(response) => &response.model_class,
            Outcome::Failure(_) => MODEL_CLASS_ERROR,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}
