//! SQLite pool setup and schema migration.

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr};

const INIT_MIGRATION: &str = include_str!("../migrations/0001_init.sql");

/// Open the pool, creating the database file (and its directory) if missing.
pub async fn connect(database_url: &str) -> sqlx::Result<SqlitePool> {
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// Run the embedded schema, statement by statement.
pub async fn run_migrations(db: &SqlitePool) -> sqlx::Result<()> {
    let statements = INIT_MIGRATION
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

/// Single-connection in-memory database with the schema applied.
#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    run_migrations(&pool).await.expect("schema applies");
    pool
}

/// File-backed database served by a multi-connection pool, so concurrent
/// transactions really contend. The files are removed on drop.
#[cfg(test)]
pub struct ScratchDatabase {
    pub pool: SqlitePool,
    path: std::path::PathBuf,
}

#[cfg(test)]
impl ScratchDatabase {
    pub async fn open() -> Self {
        let path = std::env::temp_dir().join(format!("site-storage-{}.db", uuid::Uuid::new_v4()));
        let pool = connect(&format!("sqlite://{}", path.display()))
            .await
            .expect("scratch sqlite");
        run_migrations(&pool).await.expect("schema applies");
        Self { pool, path }
    }
}

#[cfg(test)]
impl Drop for ScratchDatabase {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_repeatable() {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(tables, vec!["file_items", "storage_quota"]);
    }
}
