//! # Garden Repository
//!
//! Federation members and the namespaces they own.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use garden_core::{ConnectionType, Garden};

/// Repository for gardens, keyed by name.
#[derive(Debug, Clone)]
pub struct GardenRepository {
    pool: SqlitePool,
}

impl GardenRepository {
    /// Creates a new GardenRepository.
    pub fn new(pool: SqlitePool) -> Self {
        GardenRepository { pool }
    }

    /// Gets a garden by name.
    pub async fn get(&self, name: &str) -> DbResult<Option<Garden>> {
        let row = sqlx::query("SELECT name, connection_type, namespaces FROM gardens WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| garden_from_row(&row)).transpose()
    }

    /// Lists every garden, ordered by name.
    pub async fn list(&self) -> DbResult<Vec<Garden>> {
        let rows = sqlx::query("SELECT name, connection_type, namespaces FROM gardens ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(garden_from_row).collect()
    }

    /// Lists gardens that are connected and not local.
    pub async fn list_remote(&self) -> DbResult<Vec<Garden>> {
        let rows = sqlx::query(
            r#"
            SELECT name, connection_type, namespaces
            FROM gardens
            WHERE connection_type IS NOT NULL AND connection_type != ?1
            ORDER BY name
            "#,
        )
        .bind(ConnectionType::Local.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(garden_from_row).collect()
    }

    /// Inserts or replaces the garden keyed by name.
    pub async fn upsert(&self, garden: &Garden) -> DbResult<()> {
        debug!(garden = %garden.name, "Saving garden");

        let namespaces = serde_json::to_string(&garden.namespaces)?;

        sqlx::query(
            r#"
            INSERT INTO gardens (name, connection_type, namespaces)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                connection_type = excluded.connection_type,
                namespaces = excluded.namespaces
            "#,
        )
        .bind(&garden.name)
        .bind(garden.connection_type.map(|kind| kind.as_str()))
        .bind(namespaces)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn garden_from_row(row: &SqliteRow) -> DbResult<Garden> {
    let connection_type: Option<String> = row.try_get("connection_type")?;
    let namespaces: String = row.try_get("namespaces")?;

    let connection_type = connection_type
        .map(|kind| {
            kind.parse::<ConnectionType>()
                .map_err(|e| DbError::InvalidDocument(e.to_string()))
        })
        .transpose()?;

    Ok(Garden {
        name: row.try_get("name")?,
        connection_type,
        namespaces: serde_json::from_str(&namespaces)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig};
    use garden_core::{ConnectionType, Garden};

    #[tokio::test]
    async fn test_list_remote_skips_local_and_unconnected() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.gardens();

        repo.upsert(&Garden::new("parent", Some(ConnectionType::Local)))
            .await
            .unwrap();
        repo.upsert(&Garden::new("pending", None)).await.unwrap();
        repo.upsert(
            &Garden::new("child", Some(ConnectionType::Stomp)).with_namespaces(["ns1", "ns2"]),
        )
        .await
        .unwrap();

        let remote = repo.list_remote().await.unwrap();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].name, "child");
        assert!(remote[0].namespaces.contains("ns2"));

        assert_eq!(repo.list().await.unwrap().len(), 3);
        assert_eq!(repo.get("pending").await.unwrap().unwrap().connection_type, None);
    }
}
