//! # User Repository
//!
//! Local identities and their role assignments.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use garden_core::User;

/// Repository for local users.
#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    /// Creates a new UserRepository.
    pub fn new(pool: SqlitePool) -> Self {
        UserRepository { pool }
    }

    /// Gets a user by username.
    ///
    /// ## Returns
    /// * `Ok(Some(User))` - User found
    /// * `Ok(None)` - No such user
    pub async fn get(&self, username: &str) -> DbResult<Option<User>> {
        let row = sqlx::query(
            "SELECT username, password, role_assignments FROM users WHERE username = ?1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| user_from_row(&row)).transpose()
    }

    /// Lists every local user, ordered by username.
    pub async fn list(&self) -> DbResult<Vec<User>> {
        let rows = sqlx::query(
            "SELECT username, password, role_assignments FROM users ORDER BY username",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(user_from_row).collect()
    }

    /// Inserts or replaces the user keyed by username.
    pub async fn upsert(&self, user: &User) -> DbResult<()> {
        debug!(username = %user.username, "Saving user");

        let role_assignments = serde_json::to_string(&user.role_assignments)?;

        sqlx::query(
            r#"
            INSERT INTO users (username, password, role_assignments)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(username) DO UPDATE SET
                password = excluded.password,
                role_assignments = excluded.role_assignments
            "#,
        )
        .bind(&user.username)
        .bind(&user.password)
        .bind(role_assignments)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Deletes a user. Returns false if there was nothing to delete.
    pub async fn delete(&self, username: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM users WHERE username = ?1")
            .bind(username)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn user_from_row(row: &SqliteRow) -> DbResult<User> {
    let role_assignments: String = row.try_get("role_assignments")?;

    Ok(User {
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        role_assignments: serde_json::from_str(&role_assignments)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig};
    use garden_core::{RoleAssignment, RoleDomain, User};

    #[tokio::test]
    async fn test_upsert_then_get() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.users();

        let mut user = User::new("ada");
        user.role_assignments
            .push(RoleAssignment::new("admin", RoleDomain::Global));
        repo.upsert(&user).await.unwrap();

        assert_eq!(repo.get("ada").await.unwrap(), Some(user.clone()));

        // second upsert replaces, never duplicates
        user.role_assignments.clear();
        repo.upsert(&user).await.unwrap();
        assert_eq!(repo.list().await.unwrap(), vec![user]);
    }

    #[tokio::test]
    async fn test_missing_user_and_delete() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.users();

        assert_eq!(repo.get("nobody").await.unwrap(), None);
        assert!(!repo.delete("nobody").await.unwrap());

        repo.upsert(&User::new("ada")).await.unwrap();
        assert!(repo.delete("ada").await.unwrap());
        assert!(repo.list().await.unwrap().is_empty());
    }
}
