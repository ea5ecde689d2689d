//! Persisted branch table access.
//!
//! Every write is one statement touching one `(repo_id, name)` row, so
//! writers of different branches never wait on each other and the database
//! serializes writers of the same branch.

use std::sync::Arc;

use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder,
};

use super::{Branch, BranchCommit};
use crate::db::entities::branch;
use crate::error::{is_unique_violation, Result, ServerError};

/// How an upsert landed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upserted {
    /// An existing row (active or soft-deleted) was overwritten
    Updated,
    Inserted,
}

#[derive(Clone)]
pub struct BranchStore {
    db: Arc<DatabaseConnection>,
}

impl BranchStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get(&self, repo_id: i64, name: &str) -> Result<Branch> {
        self.find(repo_id, name)
            .await?
            .ok_or_else(|| ServerError::BranchNotFound(name.to_string()))
    }

    pub async fn find(&self, repo_id: i64, name: &str) -> Result<Option<Branch>> {
        branch::Entity::find()
            .filter(branch::Column::RepoId.eq(repo_id))
            .filter(branch::Column::Name.eq(name))
            .one(self.db.as_ref())
            .await?
            .map(Branch::try_from)
            .transpose()
    }

    /// Point `name` at `commit` and mark it active, creating the row if
    /// needed. A soft-deleted row is revived in place with its audit cleared.
    pub async fn upsert(&self, repo_id: i64, name: &str, commit: &BranchCommit) -> Result<Upserted> {
        if self.update_in_place(repo_id, name, commit).await? > 0 {
            return Ok(Upserted::Updated);
        }

        match self.insert(repo_id, name, commit).await {
            Ok(()) => Ok(Upserted::Inserted),
            Err(ServerError::UniquenessRace(_)) => {
                // Another push created the row between our update and insert
                tracing::debug!("branch {} of repo {} created concurrently, updating", name, repo_id);
                if self.update_in_place(repo_id, name, commit).await? > 0 {
                    Ok(Upserted::Updated)
                } else {
                    Err(ServerError::UniquenessRace(name.to_string()))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn update_in_place(&self, repo_id: i64, name: &str, commit: &BranchCommit) -> Result<u64> {
        let result = branch::Entity::update_many()
            .col_expr(branch::Column::CommitId, Expr::value(commit.id.to_hex()))
            .col_expr(branch::Column::CommitMessage, Expr::value(commit.message.clone()))
            .col_expr(branch::Column::CommitTime, Expr::value(commit.time))
            .col_expr(branch::Column::PusherId, Expr::value(commit.pusher_id))
            .col_expr(branch::Column::IsDeleted, Expr::value(false))
            .col_expr(branch::Column::DeletedById, Expr::value(Option::<i64>::None))
            .col_expr(branch::Column::DeletedUnix, Expr::value(Option::<i64>::None))
            .filter(branch::Column::RepoId.eq(repo_id))
            .filter(branch::Column::Name.eq(name))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected)
    }

    async fn insert(&self, repo_id: i64, name: &str, commit: &BranchCommit) -> Result<()> {
        let row = branch::ActiveModel {
            repo_id: Set(repo_id),
            name: Set(name.to_string()),
            commit_id: Set(commit.id.to_hex()),
            commit_message: Set(commit.message.clone()),
            commit_time: Set(commit.time),
            pusher_id: Set(commit.pusher_id),
            is_deleted: Set(false),
            deleted_by_id: Set(None),
            deleted_unix: Set(None),
            ..Default::default()
        };

        match branch::Entity::insert(row).exec(self.db.as_ref()).await {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(ServerError::UniquenessRace(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Mark a branch deleted. Returns false when there was no active row.
    /// Only the first deletion is recorded; repeating it keeps the audit.
    pub async fn soft_delete(&self, repo_id: i64, name: &str, deleter_id: i64, timestamp: i64) -> Result<bool> {
        let result = branch::Entity::update_many()
            .col_expr(branch::Column::IsDeleted, Expr::value(true))
            .col_expr(branch::Column::DeletedById, Expr::value(deleter_id))
            .col_expr(branch::Column::DeletedUnix, Expr::value(timestamp))
            .filter(branch::Column::RepoId.eq(repo_id))
            .filter(branch::Column::Name.eq(name))
            .filter(branch::Column::IsDeleted.eq(false))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Hard-delete every row of a repository. Repository deletion only.
    pub async fn purge(&self, repo_id: i64) -> Result<u64> {
        let result = branch::Entity::delete_many()
            .filter(branch::Column::RepoId.eq(repo_id))
            .exec(self.db.as_ref())
            .await?;
        tracing::info!("purged {} branch rows of repo {}", result.rows_affected, repo_id);
        Ok(result.rows_affected)
    }

    /// Live branches ordered by name
    pub async fn list_non_deleted(&self, repo_id: i64) -> Result<Vec<Branch>> {
        let rows = branch::Entity::find()
            .filter(branch::Column::RepoId.eq(repo_id))
            .filter(branch::Column::IsDeleted.eq(false))
            .order_by_asc(branch::Column::Name)
            .all(self.db.as_ref())
            .await?;
        rows.into_iter().map(Branch::try_from).collect()
    }

    /// Every row including soft-deleted ones, ordered by name
    pub async fn list_all(&self, repo_id: i64) -> Result<Vec<Branch>> {
        let rows = branch::Entity::find()
            .filter(branch::Column::RepoId.eq(repo_id))
            .order_by_asc(branch::Column::Name)
            .all(self.db.as_ref())
            .await?;
        rows.into_iter().map(Branch::try_from).collect()
    }

    pub async fn count(&self, repo_id: i64) -> Result<u64> {
        let count = branch::Entity::find()
            .filter(branch::Column::RepoId.eq(repo_id))
            .filter(branch::Column::IsDeleted.eq(false))
            .count(self.db.as_ref())
            .await?;
        Ok(count)
    }
}
