//! Keeps a repository's default branch pointing at a live branch.
//!
//! Choice order: the current default if it is still live, then the first
//! configured fallback name that is live, then the alphabetically first
//! live branch. With no live branch the default is cleared.

use std::sync::Arc;

use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

use super::BranchStore;
use crate::db::entities::repository;
use crate::error::{Result, ServerError};

/// Compare-and-set attempts before giving up on a contended default
const MAX_ATTEMPTS: usize = 4;

/// Pick the default branch. `live` must be sorted by name.
pub fn choose_default(current: Option<&str>, live: &[String], fallbacks: &[String]) -> Option<String> {
    let is_live = |name: &str| live.binary_search_by(|b| b.as_str().cmp(name)).is_ok();

    if let Some(current) = current.filter(|c| is_live(*c)) {
        return Some(current.to_string());
    }
    fallbacks
        .iter()
        .find(|name| is_live(name.as_str()))
        .or_else(|| live.first())
        .cloned()
}

#[derive(Clone)]
pub struct DefaultBranchResolver {
    db: Arc<DatabaseConnection>,
    store: BranchStore,
    fallbacks: Vec<String>,
}

impl DefaultBranchResolver {
    pub fn new(db: Arc<DatabaseConnection>, fallbacks: Vec<String>) -> Self {
        Self {
            store: BranchStore::new(db.clone()),
            db,
            fallbacks,
        }
    }

    /// Make sure the default names a live branch (or is unset when none is
    /// left) and return it.
    pub async fn ensure_default_branch(&self, repo_id: i64) -> Result<Option<String>> {
        for _ in 0..MAX_ATTEMPTS {
            let current = self.current_default(repo_id).await?;
            let live: Vec<String> = self
                .store
                .list_non_deleted(repo_id)
                .await?
                .into_iter()
                .map(|b| b.name)
                .collect();

            let chosen = choose_default(current.as_deref(), &live, &self.fallbacks);
            if chosen == current {
                return Ok(chosen);
            }

            if self.compare_and_set(repo_id, current.as_deref(), chosen.as_deref()).await? {
                match &chosen {
                    Some(name) => tracing::info!(
                        "repo {} default branch {:?} -> {}",
                        repo_id,
                        current,
                        name
                    ),
                    None => tracing::info!("repo {} has no branches left, default cleared", repo_id),
                }
                return Ok(chosen);
            }
            tracing::debug!("repo {} default branch changed concurrently, retrying", repo_id);
        }

        tracing::warn!(
            "repo {}: default branch still contended after {} attempts",
            repo_id,
            MAX_ATTEMPTS
        );
        self.current_default(repo_id).await
    }

    /// Called after `deleted_name` was soft-deleted. Only acts when it was
    /// the default; returns the default branch in effect afterwards.
    pub async fn on_branch_deleted(&self, repo_id: i64, deleted_name: &str) -> Result<Option<String>> {
        let current = self.current_default(repo_id).await?;
        if current.as_deref() != Some(deleted_name) {
            return Ok(current);
        }
        tracing::debug!("repo {}: default branch {} was deleted", repo_id, deleted_name);
        self.ensure_default_branch(repo_id).await
    }

    async fn current_default(&self, repo_id: i64) -> Result<Option<String>> {
        let repo = repository::Entity::find_by_id(repo_id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServerError::RepoNotFound(repo_id.to_string()))?;
        Ok(repo.default_branch)
    }

    /// Write `new` only if the stored default is still `expected`.
    async fn compare_and_set(&self, repo_id: i64, expected: Option<&str>, new: Option<&str>) -> Result<bool> {
        let update = repository::Entity::update_many()
            .col_expr(
                repository::Column::DefaultBranch,
                Expr::value(new.map(String::from)),
            )
            .filter(repository::Column::Id.eq(repo_id));

        let update = match expected {
            Some(name) => update.filter(repository::Column::DefaultBranch.eq(name)),
            None => update.filter(repository::Column::DefaultBranch.is_null()),
        };

        let result = update.exec(self.db.as_ref()).await?;
        Ok(result.rows_affected == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchCommit;
    use crate::db::test_database;
    use crate::git::ObjectId;
    use crate::repo::RepoService;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_choose_default_policy() {
        let fallbacks = names(&["main", "master"]);

        // Live current default is kept
        let live = names(&["dev", "main", "topic"]);
        assert_eq!(choose_default(Some("topic"), &live, &fallbacks).as_deref(), Some("topic"));

        // Dead default falls back in configured order
        let live = names(&["dev", "main", "master"]);
        assert_eq!(choose_default(Some("gone"), &live, &fallbacks).as_deref(), Some("main"));
        let live = names(&["dev", "master"]);
        assert_eq!(choose_default(None, &live, &fallbacks).as_deref(), Some("master"));

        // No fallback alive: alphabetical first
        let live = names(&["beta", "zeta"]);
        assert_eq!(choose_default(Some("main"), &live, &fallbacks).as_deref(), Some("beta"));

        // Nothing alive
        assert_eq!(choose_default(Some("main"), &[], &fallbacks), None);
    }

    async fn setup() -> (tempfile::TempDir, DefaultBranchResolver, BranchStore, RepoService, i64) {
        let (dir, db) = test_database().await;
        let db = Arc::new(db);
        let repos = RepoService::new(db.clone());
        let repo = repos.create("alice", "widgets", Some("main")).await.unwrap();
        let resolver = DefaultBranchResolver::new(db.clone(), names(&["main", "master"]));
        (dir, resolver, BranchStore::new(db), repos, repo.id)
    }

    fn commit() -> BranchCommit {
        BranchCommit {
            id: ObjectId::from_raw([1; 20]),
            message: String::new(),
            time: 0,
            pusher_id: 1,
        }
    }

    #[tokio::test]
    async fn test_missing_default_is_replaced() {
        let (_dir, resolver, store, repos, repo_id) = setup().await;
        store.upsert(repo_id, "master", &commit()).await.unwrap();
        store.upsert(repo_id, "branch-0", &commit()).await.unwrap();

        let chosen = resolver.ensure_default_branch(repo_id).await.unwrap();
        assert_eq!(chosen.as_deref(), Some("master"));
        assert_eq!(repos.default_branch(repo_id).await.unwrap().as_deref(), Some("master"));
    }

    #[tokio::test]
    async fn test_deleting_default_moves_it() {
        let (_dir, resolver, store, repos, repo_id) = setup().await;
        for name in ["main", "feature", "alpha"] {
            store.upsert(repo_id, name, &commit()).await.unwrap();
        }
        resolver.ensure_default_branch(repo_id).await.unwrap();

        // Deleting a non-default branch leaves the default alone
        store.soft_delete(repo_id, "feature", 1, 1).await.unwrap();
        let after = resolver.on_branch_deleted(repo_id, "feature").await.unwrap();
        assert_eq!(after.as_deref(), Some("main"));

        store.soft_delete(repo_id, "main", 1, 1).await.unwrap();
        let after = resolver.on_branch_deleted(repo_id, "main").await.unwrap();
        assert_eq!(after.as_deref(), Some("alpha"));
        assert_eq!(repos.default_branch(repo_id).await.unwrap().as_deref(), Some("alpha"));
    }

    #[tokio::test]
    async fn test_last_branch_deleted_clears_default() {
        let (_dir, resolver, store, repos, repo_id) = setup().await;
        store.upsert(repo_id, "main", &commit()).await.unwrap();
        store.soft_delete(repo_id, "main", 1, 1).await.unwrap();

        assert_eq!(resolver.on_branch_deleted(repo_id, "main").await.unwrap(), None);
        assert_eq!(repos.default_branch(repo_id).await.unwrap(), None);

        // Pushing again into the emptied repo picks the new branch up
        store.upsert(repo_id, "fresh", &commit()).await.unwrap();
        assert_eq!(
            resolver.ensure_default_branch(repo_id).await.unwrap().as_deref(),
            Some("fresh")
        );
    }

    #[tokio::test]
    async fn test_unknown_repository() {
        let (_dir, resolver, _store, _repos, repo_id) = setup().await;
        let err = resolver.ensure_default_branch(repo_id + 100).await.unwrap_err();
        assert!(matches!(err, ServerError::RepoNotFound(_)));
    }
}
