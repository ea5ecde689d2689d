//! Repository lifecycle: create, look up, delete, and the aggregate fields
//! other code reads for display.

use std::sync::Arc;

use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Statement,
};

use crate::branch::{unix_now, BranchStore};
use crate::db::entities::repository;
use crate::error::{is_unique_violation, Result, ServerError};

#[derive(Clone)]
pub struct RepoService {
    db: Arc<DatabaseConnection>,
}

impl RepoService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Create an empty repository. `default_branch` is the name the first
    /// push is expected to create; it is replaced if that never happens.
    pub async fn create(&self, owner: &str, name: &str, default_branch: Option<&str>) -> Result<repository::Model> {
        let full_name = format!("{}/{}", owner, name);
        let row = repository::ActiveModel {
            owner: Set(owner.to_string()),
            name: Set(name.to_string()),
            default_branch: Set(default_branch.map(String::from)),
            num_branches: Set(0),
            created_at: Set(unix_now()),
            ..Default::default()
        };

        match row.insert(self.db.as_ref()).await {
            Ok(model) => {
                tracing::info!("created repository {} (id {})", full_name, model.id);
                Ok(model)
            }
            Err(e) if is_unique_violation(&e) => Err(ServerError::RepoAlreadyExists(full_name)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, repo_id: i64) -> Result<repository::Model> {
        repository::Entity::find_by_id(repo_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServerError::RepoNotFound(repo_id.to_string()))
    }

    pub async fn find(&self, owner: &str, name: &str) -> Result<repository::Model> {
        repository::Entity::find()
            .filter(repository::Column::Owner.eq(owner))
            .filter(repository::Column::Name.eq(name))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServerError::RepoNotFound(format!("{}/{}", owner, name)))
    }

    pub async fn list(&self) -> Result<Vec<repository::Model>> {
        Ok(repository::Entity::find()
            .order_by_asc(repository::Column::Owner)
            .order_by_asc(repository::Column::Name)
            .all(self.db.as_ref())
            .await?)
    }

    /// Delete a repository together with all of its branch rows.
    pub async fn delete(&self, repo_id: i64) -> Result<()> {
        let repo = self.get(repo_id).await?;
        self.purge_all_branches(repo_id).await?;
        repository::Entity::delete_by_id(repo_id)
            .exec(self.db.as_ref())
            .await?;
        tracing::info!("deleted repository {}", repo.full_name());
        Ok(())
    }

    pub async fn purge_all_branches(&self, repo_id: i64) -> Result<u64> {
        BranchStore::new(self.db.clone()).purge(repo_id).await
    }

    pub async fn default_branch(&self, repo_id: i64) -> Result<Option<String>> {
        Ok(self.get(repo_id).await?.default_branch)
    }

    pub async fn num_branches(&self, repo_id: i64) -> Result<i64> {
        Ok(self.get(repo_id).await?.num_branches)
    }

    /// Recount live branches and store the result in one statement, so a
    /// concurrent push can never overwrite a newer count with a stale one.
    pub async fn refresh_num_branches(&self, repo_id: i64) -> Result<i64> {
        let backend = self.db.get_database_backend();
        self.db
            .execute(Statement::from_sql_and_values(
                backend,
                r#"UPDATE repositories
                   SET num_branches = (
                       SELECT COUNT(*) FROM branches WHERE repo_id = ? AND is_deleted = 0
                   )
                   WHERE id = ?"#,
                [repo_id.into(), repo_id.into()],
            ))
            .await?;
        self.num_branches(repo_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchCommit;
    use crate::db::test_database;
    use crate::git::ObjectId;

    #[tokio::test]
    async fn test_create_and_find() {
        let (_dir, db) = test_database().await;
        let repos = RepoService::new(Arc::new(db));

        let created = repos.create("alice", "widgets", Some("main")).await.unwrap();
        assert_eq!(created.default_branch.as_deref(), Some("main"));
        assert_eq!(created.num_branches, 0);

        let found = repos.find("alice", "widgets").await.unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.full_name(), "alice/widgets");

        let err = repos.create("alice", "widgets", None).await.unwrap_err();
        assert!(matches!(err, ServerError::RepoAlreadyExists(_)));

        let err = repos.find("bob", "widgets").await.unwrap_err();
        assert!(matches!(err, ServerError::RepoNotFound(_)));
    }

    #[tokio::test]
    async fn test_refresh_counts_live_rows_only() {
        let (_dir, db) = test_database().await;
        let db = Arc::new(db);
        let repos = RepoService::new(db.clone());
        let store = BranchStore::new(db);
        let repo = repos.create("alice", "widgets", None).await.unwrap();

        let commit = BranchCommit {
            id: ObjectId::from_raw([1; 20]),
            message: String::new(),
            time: 0,
            pusher_id: 1,
        };
        for name in ["a", "b", "c"] {
            store.upsert(repo.id, name, &commit).await.unwrap();
        }
        store.soft_delete(repo.id, "b", 1, 1).await.unwrap();

        assert_eq!(repos.refresh_num_branches(repo.id).await.unwrap(), 2);
        assert_eq!(repos.num_branches(repo.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_purges_branches() {
        let (_dir, db) = test_database().await;
        let db = Arc::new(db);
        let repos = RepoService::new(db.clone());
        let store = BranchStore::new(db);
        let repo = repos.create("alice", "widgets", None).await.unwrap();

        let commit = BranchCommit {
            id: ObjectId::from_raw([1; 20]),
            message: String::new(),
            time: 0,
            pusher_id: 1,
        };
        store.upsert(repo.id, "main", &commit).await.unwrap();
        store.upsert(repo.id, "old", &commit).await.unwrap();
        store.soft_delete(repo.id, "old", 1, 1).await.unwrap();

        repos.delete(repo.id).await.unwrap();
        assert!(store.list_all(repo.id).await.unwrap().is_empty());
        assert!(matches!(repos.get(repo.id).await, Err(ServerError::RepoNotFound(_))));
        assert!(matches!(repos.delete(repo.id).await, Err(ServerError::RepoNotFound(_))));
    }
}
