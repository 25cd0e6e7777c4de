//! # Job Control
//!
//! Create, read, list, pause, resume, delete and patch scheduled jobs,
//! locally or on a remote garden through the router.
//!
//! ## Patch State Machine
//! ```text
//!             update /status PAUSED
//!   RUNNING ─────────────────────────► PAUSED
//!      ▲                                  │
//!      └──────────────────────────────────┘
//!             update /status RUNNING
//!
//!   Every instruction of a patch is validated before the first backend
//!   call. A patch with one bad instruction changes nothing.
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use garden_core::validation::{validate_job_definition, validate_patch};
use garden_core::{
    Job, JobDefinition, JobStatus, Operation, OperationKind, PatchRequest, Response,
    ValidationError,
};
use garden_db::Database;

use crate::error::{SyncError, SyncResult};
use crate::router::{HandlerTableBuilder, OperationHandler, Router};

/// Model class of job replies.
pub const MODEL_CLASS_JOB: &str = "Job";

// =============================================================================
// Scheduler Backend
// =============================================================================

/// The scheduler that actually owns job execution.
#[async_trait]
pub trait SchedulerBackend: Send + Sync {
    async fn create_job(&self, definition: JobDefinition) -> SyncResult<Job>;
    async fn pause_job(&self, id: &str) -> SyncResult<Job>;
    async fn resume_job(&self, id: &str) -> SyncResult<Job>;
    async fn remove_job(&self, id: &str) -> SyncResult<()>;
}

/// In-process scheduler keeping job state in the job store.
#[derive(Clone)]
pub struct DbScheduler {
    db: Database,
}

impl DbScheduler {
    pub fn new(db: Database) -> Self {
        DbScheduler { db }
    }
}

#[async_trait]
impl SchedulerBackend for DbScheduler {
    async fn create_job(&self, definition: JobDefinition) -> SyncResult<Job> {
        validate_job_definition(&definition)?;

        let job = Job {
            id: Uuid::new_v4().to_string(),
            name: definition.name,
            trigger_type: definition.trigger_type,
            trigger: definition.trigger,
            request_template: definition.request_template,
            status: JobStatus::Running,
            created_at: Utc::now(),
        };

        self.db.jobs().insert(&job).await?;
        Ok(job)
    }

    async fn pause_job(&self, id: &str) -> SyncResult<Job> {
        Ok(self.db.jobs().update_status(id, JobStatus::Paused).await?)
    }

    async fn resume_job(&self, id: &str) -> SyncResult<Job> {
        Ok(self.db.jobs().update_status(id, JobStatus::Running).await?)
    }

    async fn remove_job(&self, id: &str) -> SyncResult<()> {
        if self.db.jobs().delete(id).await? {
            Ok(())
        } else {
            Err(SyncError::NotFound {
                entity: "Job".into(),
                id: id.into(),
            })
        }
    }
}

// =============================================================================
// Job Control Facade
// =============================================================================

pub struct JobControl {
    db: Database,
    backend: Arc<dyn SchedulerBackend>,
}

impl JobControl {
    pub fn new(db: Database, backend: Arc<dyn SchedulerBackend>) -> Self {
        JobControl { db, backend }
    }

    pub async fn create(&self, definition: JobDefinition) -> SyncResult<Job> {
        let job = self.backend.create_job(definition).await?;
        info!(job_id = %job.id, name = %job.name, "Job created");
        Ok(job)
    }

    pub async fn get(&self, id: &str) -> SyncResult<Job> {
        self.db
            .jobs()
            .get(id)
            .await?
            .ok_or_else(|| SyncError::NotFound {
                entity: "Job".into(),
                id: id.into(),
            })
    }

    /// Jobs whose attributes equal every filter value. Unknown attribute
    /// names are ignored.
    pub async fn list(&self, filter: &[(String, String)]) -> SyncResult<Vec<Job>> {
        Ok(self.db.jobs().list(filter).await?)
    }

    /// Validates the whole patch, then applies it in order.
    ///
    /// Returns the job as left by the last instruction.
    pub async fn apply_patch(&self, id: &str, patch: &PatchRequest) -> SyncResult<Job> {
        let statuses = validate_patch(patch)?;

        let mut job = None;
        for status in statuses {
            job = Some(match status {
                JobStatus::Paused => self.pause(id).await?,
                JobStatus::Running => self.resume(id).await?,
            });
        }

        job.ok_or_else(|| {
            SyncError::Validation(ValidationError::Required {
                field: "operations".into(),
            })
        })
    }

    pub async fn pause(&self, id: &str) -> SyncResult<Job> {
        let job = self.backend.pause_job(id).await?;
        info!(job_id = %id, "Job paused");
        Ok(job)
    }

    pub async fn resume(&self, id: &str) -> SyncResult<Job> {
        let job = self.backend.resume_job(id).await?;
        info!(job_id = %id, "Job resumed");
        Ok(job)
    }

    pub async fn delete(&self, id: &str) -> SyncResult<()> {
        self.backend.remove_job(id).await?;
        info!(job_id = %id, "Job deleted");
        Ok(())
    }
}

// =============================================================================
// Operation Handlers
// =============================================================================

/// Registers the JOB_* handlers.
pub fn register(
    builder: HandlerTableBuilder,
    control: Arc<JobControl>,
) -> SyncResult<HandlerTableBuilder> {
    let handler: Arc<dyn OperationHandler> = Arc::new(JobOperations { control });

    [
        OperationKind::JobCreate,
        OperationKind::JobRead,
        OperationKind::JobReadAll,
        OperationKind::JobUpdate,
        OperationKind::JobPause,
        OperationKind::JobResume,
        OperationKind::JobDelete,
    ]
    .into_iter()
    .try_fold(builder, |builder, kind| builder.register(kind, handler.clone()))
}

struct JobOperations {
    control: Arc<JobControl>,
}

#[async_trait]
impl OperationHandler for JobOperations {
    async fn handle(&self, _router: &Router, operation: Operation) -> SyncResult<Response> {
        let kind = operation.kind()?;
        debug!(operation = %kind, "Job operation");

        let job = match kind {
            OperationKind::JobCreate => {
                let definition: JobDefinition = object_param(&operation, "job", 0)?;
                self.control.create(definition).await?
            }
            OperationKind::JobRead => self.control.get(job_id(&operation)?).await?,
            OperationKind::JobReadAll => {
                let jobs = self.control.list(&filter_params(&operation)).await?;
                return Ok(Response::new(MODEL_CLASS_JOB, serde_json::to_value(jobs)?));
            }
            OperationKind::JobUpdate => {
                let patch: PatchRequest = object_param(&operation, "patch", 1)?;
                self.control.apply_patch(job_id(&operation)?, &patch).await?
            }
            OperationKind::JobPause => self.control.pause(job_id(&operation)?).await?,
            OperationKind::JobResume => self.control.resume(job_id(&operation)?).await?,
            OperationKind::JobDelete => {
                self.control.delete(job_id(&operation)?).await?;
                return Ok(Response::ack());
            }
            other => {
                return Err(SyncError::Routing(format!(
                    "{} is not a job operation",
                    other
                )))
            }
        };

        Ok(Response::new(MODEL_CLASS_JOB, serde_json::to_value(job)?))
    }
}

fn job_id(operation: &Operation) -> SyncResult<&str> {
    operation
        .str_param("job_id")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            SyncError::Validation(ValidationError::Required {
                field: "job_id".into(),
            })
        })
}

/// Named kwarg, falling back to the positional argument at `position`.
fn object_param<T: DeserializeOwned>(
    operation: &Operation,
    key: &str,
    position: usize,
) -> SyncResult<T> {
    let value = operation
        .kwarg(key)
        .or_else(|| operation.args().get(position))
        .ok_or_else(|| ValidationError::Required { field: key.into() })?;

    serde_json::from_value(value.clone()).map_err(|e| {
        SyncError::Validation(ValidationError::InvalidFormat {
            field: key.into(),
            reason: e.to_string(),
        })
    })
}

fn filter_params(operation: &Operation) -> Vec<(String, String)> {
    operation
        .kwarg("filter_params")
        .and_then(Value::as_object)
        .map(|params| {
            params
                .iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::GardenRegistry;
    use crate::router::HandlerTable;
    use garden_core::{ErrorKind, PatchOperation};
    use garden_db::DbConfig;
    use serde_json::json;
    use std::sync::Mutex;

    async fn setup() -> (Database, JobControl) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let control = JobControl::new(db.clone(), Arc::new(DbScheduler::new(db.clone())));
        (db, control)
    }

    fn definition(name: &str) -> JobDefinition {
        JobDefinition {
            name: name.into(),
            trigger_type: "interval".into(),
            trigger: json!({"minutes": 5}),
            request_template: json!({"system": "echo", "command": "say"}),
        }
    }

    /// Records backend calls without touching any store.
    #[derive(Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingBackend {
        fn job(id: &str, status: JobStatus) -> Job {
            Job {
                id: id.into(),
                name: "n".into(),
                trigger_type: "cron".into(),
                trigger: Value::Null,
                request_template: Value::Null,
                status,
                created_at: Utc::now(),
            }
        }
    }

    #[async_trait]
    impl SchedulerBackend for RecordingBackend {
        async fn create_job(&self, definition: JobDefinition) -> SyncResult<Job> {
            self.calls.lock().unwrap().push(format!("create:{}", definition.name));
            Ok(Self::job("new", JobStatus::Running))
        }
        async fn pause_job(&self, id: &str) -> SyncResult<Job> {
            self.calls.lock().unwrap().push(format!("pause:{}", id));
            Ok(Self::job(id, JobStatus::Paused))
        }
        async fn resume_job(&self, id: &str) -> SyncResult<Job> {
            self.calls.lock().unwrap().push(format!("resume:{}", id));
            Ok(Self::job(id, JobStatus::Running))
        }
        async fn remove_job(&self, id: &str) -> SyncResult<()> {
            self.calls.lock().unwrap().push(format!("remove:{}", id));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_create_get_list() {
        let (_db, control) = setup().await;

        let job = control.create(definition("nightly")).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        let fetched = control.get(&job.id).await.unwrap();
        assert_eq!(fetched.name, "nightly");
        assert_eq!(fetched.trigger, json!({"minutes": 5}));

        control.create(definition("hourly")).await.unwrap();
        let filter = vec![
            ("name".to_string(), "nightly".to_string()),
            ("colour".to_string(), "blue".to_string()),
        ];
        let listed = control.list(&filter).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, job.id);
        assert_eq!(control.list(&[]).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_definition_is_rejected() {
        let (db, control) = setup().await;
        let mut bad = definition("x");
        bad.trigger_type = "sometimes".into();

        let err = control.create(bad).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(db.jobs().list(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pause_resume_delete() {
        let (_db, control) = setup().await;
        let job = control.create(definition("nightly")).await.unwrap();

        assert_eq!(control.pause(&job.id).await.unwrap().status, JobStatus::Paused);
        assert_eq!(control.resume(&job.id).await.unwrap().status, JobStatus::Running);

        control.delete(&job.id).await.unwrap();
        let err = control.get(&job.id).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
        assert!(control.delete(&job.id).await.is_err());
        assert!(control.pause(&job.id).await.is_err());
    }

    #[tokio::test]
    async fn test_patch_applies_in_order() {
        let (_db, control) = setup().await;
        let job = control.create(definition("nightly")).await.unwrap();

        let patch = PatchRequest {
            operations: vec![
                PatchOperation::update_status("RUNNING"),
                PatchOperation::update_status("paused"),
            ],
        };
        let patched = control.apply_patch(&job.id, &patch).await.unwrap();
        assert_eq!(patched.status, JobStatus::Paused);
    }

    #[tokio::test]
    async fn test_invalid_patch_never_reaches_backend() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let backend = Arc::new(RecordingBackend::default());
        let control = JobControl::new(db, backend.clone());

        let cases = [
            (PatchOperation::update_status("STOPPED"), "Unsupported status value 'STOPPED'"),
            (
                PatchOperation {
                    operation: "update".into(),
                    path: "/name".into(),
                    value: json!("x"),
                },
                "Unsupported path value '/name'",
            ),
            (
                PatchOperation {
                    operation: "remove".into(),
                    path: "/status".into(),
                    value: Value::Null,
                },
                "Unsupported operation 'remove'",
            ),
        ];

        for (bad, message) in cases {
            let patch = PatchRequest {
                operations: vec![PatchOperation::update_status("PAUSED"), bad],
            };
            let err = control.apply_patch("job-1", &patch).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
            assert_eq!(err.to_error_message().message, message);
        }

        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_job_operations_through_router() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let backend = Arc::new(RecordingBackend::default());
        let control = Arc::new(JobControl::new(db, backend.clone()));
        let table = register(HandlerTable::builder(), control).unwrap().build();
        let router = Router::new("parent", table, GardenRegistry::new());

        let created = router
            .route(
                Operation::new(OperationKind::JobCreate)
                    .with_kwarg("job", serde_json::to_value(definition("nightly")).unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(created.model_class, MODEL_CLASS_JOB);
        assert_eq!(created.payload["id"], "new");

        let patched = router
            .route(
                Operation::new(OperationKind::JobUpdate)
                    .with_arg(json!("job-1"))
                    .with_arg(json!({"operations": [{"operation": "update", "path": "/status", "value": "PAUSED"}]})),
            )
            .await
            .unwrap();
        assert_eq!(patched.payload["status"], "PAUSED");

        let deleted = router
            .route(Operation::new(OperationKind::JobDelete).with_kwarg("job_id", json!("job-1")))
            .await
            .unwrap();
        assert!(deleted.is_empty());

        let err = router
            .route(Operation::new(OperationKind::JobPause))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        assert_eq!(
            *backend.calls.lock().unwrap(),
            vec!["create:nightly", "pause:job-1", "remove:job-1"]
        );
    }

    #[tokio::test]
    async fn test_read_all_filter_params() {
        let (db, control) = setup().await;
        let job = control.create(definition("nightly")).await.unwrap();
        control.pause(&job.id).await.unwrap();
        control.create(definition("hourly")).await.unwrap();

        let table = register(HandlerTable::builder(), Arc::new(control))
            .unwrap()
            .build();
        let router = Router::new("parent", table, GardenRegistry::new());

        let response = router
            .route(
                Operation::new(OperationKind::JobReadAll)
                    .with_kwarg("filter_params", json!({"status": "PAUSED"})),
            )
            .await
            .unwrap();
        let jobs = response.payload.as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["id"], json!(job.id));
        assert_eq!(db.jobs().list(&[]).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_job_kinds_register_once() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let control = Arc::new(JobControl::new(db, Arc::new(RecordingBackend::default())));

        let table = register(HandlerTable::builder(), control.clone()).unwrap().build();
        assert_eq!(table.kinds().len(), 7);
        assert!(table.get(OperationKind::UserSync).is_none());

        let builder = register(HandlerTable::builder(), control.clone()).unwrap();
        assert!(register(builder, control).is_err());
    }
}
