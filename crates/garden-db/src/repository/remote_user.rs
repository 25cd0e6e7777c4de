//! # Remote User Repository
//!
//! Shadow records of what each remote garden holds for a user.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use garden_core::RemoteUser;

/// Repository for `RemoteUser` shadows, keyed by `(garden, username)`.
#[derive(Debug, Clone)]
pub struct RemoteUserRepository {
    pool: SqlitePool,
}

impl RemoteUserRepository {
    /// Creates a new RemoteUserRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RemoteUserRepository { pool }
    }

    /// Gets the shadow for one user on one garden.
    pub async fn get(&self, garden: &str, username: &str) -> DbResult<Option<RemoteUser>> {
        let row = sqlx::query(
            r#"
            SELECT garden, username, role_assignments, updated_at
            FROM remote_users
            WHERE garden = ?1 AND username = ?2
            "#,
        )
        .bind(garden)
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| remote_user_from_row(&row)).transpose()
    }

    /// Lists every shadow held for a garden.
    pub async fn list_for_garden(&self, garden: &str) -> DbResult<Vec<RemoteUser>> {
        let rows = sqlx::query(
            r#"
            SELECT garden, username, role_assignments, updated_at
            FROM remote_users
            WHERE garden = ?1
            ORDER BY username
            "#,
        )
        .bind(garden)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(remote_user_from_row).collect()
    }

    /// Inserts or replaces the shadow keyed by `(garden, username)`.
    pub async fn upsert(&self, remote_user: &RemoteUser) -> DbResult<()> {
        debug!(
            garden = %remote_user.garden,
            username = %remote_user.username,
            "Saving remote user"
        );

        let role_assignments = serde_json::to_string(&remote_user.role_assignments)?;

        sqlx::query(
            r#"
            INSERT INTO remote_users (garden, username, role_assignments, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(garden, username) DO UPDATE SET
                role_assignments = excluded.role_assignments,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&remote_user.garden)
        .bind(&remote_user.username)
        .bind(role_assignments)
        .bind(remote_user.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn remote_user_from_row(row: &SqliteRow) -> DbResult<RemoteUser> {
    let role_assignments: String = row.try_get("role_assignments")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(RemoteUser {
        garden: row.try_get("garden")?,
        username: row.try_get("username")?,
        role_assignments: serde_json::from_str(&role_assignments)?,
        updated_at,
    })
}
