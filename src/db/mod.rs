//! Database module for SQLite persistence using SeaORM

pub mod entities;

use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};
use std::path::Path;

use crate::error::Result;

/// Initialize database connection and create tables
pub async fn init_database(db_path: &Path) -> Result<DatabaseConnection> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
    tracing::info!("Connecting to database: {}", db_url);

    let db = Database::connect(&db_url).await?;

    create_tables(&db).await?;

    Ok(db)
}

/// Create all tables if they don't exist
async fn create_tables(db: &DatabaseConnection) -> std::result::Result<(), DbErr> {
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner TEXT NOT NULL,
            name TEXT NOT NULL,
            default_branch TEXT,
            num_branches INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE(owner, name)
        )
        "#.to_string(),
    )).await?;

    // One row per (repo, branch); deleted branches keep their row
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS branches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            repo_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            commit_id TEXT NOT NULL,
            commit_message TEXT NOT NULL DEFAULT '',
            commit_time INTEGER NOT NULL DEFAULT 0,
            pusher_id INTEGER NOT NULL DEFAULT 0,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            deleted_by_id INTEGER,
            deleted_unix INTEGER,
            FOREIGN KEY (repo_id) REFERENCES repositories(id) ON DELETE CASCADE,
            UNIQUE(repo_id, name)
        )
        "#.to_string(),
    )).await?;

    // Count and list queries filter on the deleted flag
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_branches_repo_deleted ON branches(repo_id, is_deleted)"#.to_string(),
    )).await?;

    tracing::info!("Database tables initialized");
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_database() -> (tempfile::TempDir, DatabaseConnection) {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let db = init_database(&temp_dir.path().join("test.db")).await.unwrap();
    (temp_dir, db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_is_repeatable() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("sync.db");

        let db = init_database(&path).await.unwrap();
        drop(db);
        assert!(path.exists());

        // Second start over the same file must not fail on existing tables
        init_database(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_unusable_storage_path() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let err = init_database(&blocker.join("sub").join("sync.db")).await.unwrap_err();
        assert!(matches!(err, crate::error::ServerError::Io(_)));
    }
}
