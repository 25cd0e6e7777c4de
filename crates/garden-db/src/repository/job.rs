//! # Job Repository
//!
//! Stored state of scheduled jobs.
//!
//! ## Filtering
//! ```text
//! list(&[("status", "PAUSED"), ("color", "blue")])
//!        │                       │
//!        ▼                       ▼
//!   WHERE status = ?       ignored (not a job attribute)
//! ```

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use garden_core::types::JOB_FILTER_FIELDS;
use garden_core::{Job, JobStatus};

const JOB_COLUMNS: &str =
    "id, name, trigger_type, trigger_args, request_template, status, created_at";

/// Repository for jobs, keyed by id.
#[derive(Debug, Clone)]
pub struct JobRepository {
    pool: SqlitePool,
}

impl JobRepository {
    /// Creates a new JobRepository.
    pub fn new(pool: SqlitePool) -> Self {
        JobRepository { pool }
    }

    /// Gets a job by id.
    pub async fn get(&self, id: &str) -> DbResult<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| job_from_row(&row)).transpose()
    }

    /// Lists jobs matching every `(attribute, value)` pair.
    ///
    /// Pairs naming anything outside [`JOB_FILTER_FIELDS`] are ignored.
    pub async fn list(&self, filters: &[(String, String)]) -> DbResult<Vec<Job>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1 = 1"));

        for (field, value) in filters {
            // column names come from the whitelist, never from the caller
            if let Some(column) = JOB_FILTER_FIELDS.iter().find(|f| **f == field.as_str()) {
                query.push(" AND ").push(*column).push(" = ").push_bind(filter_value(column, value));
            } else {
                debug!(field = %field, "Ignoring unknown job filter");
            }
        }

        query.push(" ORDER BY created_at, id");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Inserts a new job.
    pub async fn insert(&self, job: &Job) -> DbResult<()> {
        debug!(job_id = %job.id, name = %job.name, "Inserting job");

        sqlx::query(
            r#"
            INSERT INTO jobs (id, name, trigger_type, trigger_args, request_template, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(&job.trigger_type)
        .bind(serde_json::to_string(&job.trigger)?)
        .bind(serde_json::to_string(&job.request_template)?)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Sets a job's status and returns the updated job.
    ///
    /// ## Returns
    /// * `Err(DbError::NotFound)` - no job with that id
    pub async fn update_status(&self, id: &str, status: JobStatus) -> DbResult<Job> {
        debug!(job_id = %id, %status, "Updating job status");

        let result = sqlx::query("UPDATE jobs SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Job", id));
        }

        self.get(id)
            .await?
            .ok_or_else(|| DbError::not_found("Job", id))
    }

    /// Deletes a job. Returns false if there was nothing to delete.
    pub async fn delete(&self, id: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Statuses are stored upper-case; any spelling the parser accepts matches.
fn filter_value(column: &str, value: &str) -> String {
    match column {
        "status" => value
            .parse::<JobStatus>()
            .map(|status| status.as_str().to_string())
            .unwrap_or_else(|_| value.to_string()),
        _ => value.to_string(),
    }
}

fn job_from_row(row: &SqliteRow) -> DbResult<Job> {
    let trigger: String = row.try_get("trigger_args")?;
    let request_template: String = row.try_get("request_template")?;
    let status: String = row.try_get("status")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(Job {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        trigger_type: row.try_get("trigger_type")?,
        trigger: serde_json::from_str(&trigger)?,
        request_template: serde_json::from_str(&request_template)?,
        status: status
            .parse()
            .map_err(|e: garden_core::ValidationError| DbError::InvalidDocument(e.to_string()))?,
        created_at,
    })
}
