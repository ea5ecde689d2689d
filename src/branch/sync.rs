//! Applies the branch changes of a push to the branch table.
//!
//! Changes are applied one at a time in payload order, each as an atomic
//! single-row write. A failing branch is recorded and skipped. Once every
//! change has been tried, the branch count is recomputed from the table
//! and the default branch is re-validated; both are derived from scratch
//! so a retried or interrupted push converges on the next run.

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use super::verify::ConsistencyVerifier;
use super::{
    unix_now, BranchCommit, BranchStore, DefaultBranchResolver, RefChange, RefChangeKind,
};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::git::{GitRefStore, ObjectId};
use crate::repo::RepoService;

/// A branch whose change could not be written
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchFailure {
    pub branch: String,
    pub error: String,
}

/// What one push did to the branch table
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Branches created or moved, in order of their final change
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<BranchFailure>,
    pub default_branch: Option<String>,
    pub num_branches: i64,
}

impl PushOutcome {
    /// Record the final effect on a branch; a later change to the same
    /// branch in one push supersedes an earlier one.
    fn record(&mut self, kind: RefChangeKind, branch: &str) {
        self.updated.retain(|b| b != branch);
        self.deleted.retain(|b| b != branch);
        self.failed.retain(|f| f.branch != branch);
        match kind {
            RefChangeKind::Create | RefChangeKind::Update => self.updated.push(branch.to_string()),
            RefChangeKind::Delete => self.deleted.push(branch.to_string()),
        }
    }

    fn record_failure(&mut self, branch: &str, error: String) {
        self.updated.retain(|b| b != branch);
        self.deleted.retain(|b| b != branch);
        self.failed.retain(|f| f.branch != branch);
        self.failed.push(BranchFailure {
            branch: branch.to_string(),
            error,
        });
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct BranchSyncEngine {
    store: BranchStore,
    repos: RepoService,
    resolver: DefaultBranchResolver,
    verifier: ConsistencyVerifier,
    git: Arc<dyn GitRefStore>,
    config: SyncConfig,
}

impl BranchSyncEngine {
    pub fn new(db: Arc<DatabaseConnection>, git: Arc<dyn GitRefStore>, config: SyncConfig) -> Self {
        let store = BranchStore::new(db.clone());
        Self {
            repos: RepoService::new(db.clone()),
            resolver: DefaultBranchResolver::new(db, config.fallback_branches.clone()),
            verifier: ConsistencyVerifier::new(store.clone(), git.clone()),
            store,
            git,
            config,
        }
    }

    pub fn store(&self) -> &BranchStore {
        &self.store
    }

    pub fn verifier(&self) -> &ConsistencyVerifier {
        &self.verifier
    }

    /// Apply the classified changes of one push made by `pusher_id`.
    ///
    /// Fails only if the repository does not exist or the aggregate refresh
    /// fails; per-branch errors are reported in [`PushOutcome::failed`].
    pub async fn apply_push(&self, repo_id: i64, changes: &[RefChange], pusher_id: i64) -> Result<PushOutcome> {
        let repo = self.repos.get(repo_id).await?;
        let pushed_at = unix_now();
        let mut outcome = PushOutcome::default();

        for change in changes {
            match self.apply_change(repo_id, change, pusher_id, pushed_at).await {
                Ok(()) => outcome.record(change.kind, &change.branch_name),
                Err(e) => {
                    tracing::warn!(
                        "{}: failed to {} branch {}: {}",
                        repo.full_name(),
                        change.kind.as_str(),
                        change.branch_name,
                        e
                    );
                    outcome.record_failure(&change.branch_name, e.to_string());
                }
            }
        }

        outcome.num_branches = self.repos.refresh_num_branches(repo_id).await?;
        // Resolve against the push's final state: a default deleted and then
        // recreated within the same push stays the default.
        for name in &outcome.deleted {
            self.resolver.on_branch_deleted(repo_id, name).await?;
        }
        outcome.default_branch = self.resolver.ensure_default_branch(repo_id).await?;

        if outcome.is_complete() {
            tracing::info!(
                "{}: push by {} applied ({} updated, {} deleted, {} live)",
                repo.full_name(),
                pusher_id,
                outcome.updated.len(),
                outcome.deleted.len(),
                outcome.num_branches
            );
        } else {
            tracing::error!(
                "{}: push by {} partially applied, {} of {} branch changes failed",
                repo.full_name(),
                pusher_id,
                outcome.failed.len(),
                changes.len()
            );
        }

        Ok(outcome)
    }

    async fn apply_change(&self, repo_id: i64, change: &RefChange, pusher_id: i64, pushed_at: i64) -> Result<()> {
        match change.kind {
            RefChangeKind::Create | RefChangeKind::Update => {
                let commit = self
                    .commit_for(repo_id, &change.branch_name, change.new_commit, pusher_id, pushed_at)
                    .await?;
                let upserted = self.store.upsert(repo_id, &change.branch_name, &commit).await?;
                tracing::debug!(
                    "repo {}: {} {} at {} ({:?})",
                    repo_id,
                    change.kind.as_str(),
                    change.branch_name,
                    change.new_commit,
                    upserted
                );
            }
            RefChangeKind::Delete => {
                let deleted = self
                    .store
                    .soft_delete(repo_id, &change.branch_name, pusher_id, pushed_at)
                    .await?;
                if !deleted {
                    tracing::debug!(
                        "repo {}: branch {} had no live record to delete",
                        repo_id,
                        change.branch_name
                    );
                }
            }
        }
        Ok(())
    }

    /// Commit metadata for a new head. Taken from the git store when it
    /// knows the commit, else kept from a record already at that commit, else
    /// an empty message at push time.
    async fn commit_for(
        &self,
        repo_id: i64,
        branch: &str,
        id: ObjectId,
        pusher_id: i64,
        pushed_at: i64,
    ) -> Result<BranchCommit> {
        if let Some(summary) = self.git.commit_summary(repo_id, &id) {
            return Ok(BranchCommit {
                id,
                message: summary.message,
                time: summary.time,
                pusher_id,
            });
        }

        if let Some(existing) = self.store.find(repo_id, branch).await? {
            if existing.commit.id == id {
                return Ok(BranchCommit {
                    pusher_id,
                    ..existing.commit
                });
            }
        }

        tracing::debug!("repo {}: commit {} not in git store, using push time", repo_id, id);
        Ok(BranchCommit {
            id,
            message: String::new(),
            time: pushed_at,
            pusher_id,
        })
    }

    /// Bring the branch table in line with the git refs, e.g. after an
    /// interrupted push. Changes are attributed to the system user.
    pub async fn reconcile(&self, repo_id: i64) -> Result<PushOutcome> {
        // Fail fast on unknown repositories before comparing anything
        self.repos.get(repo_id).await?;
        let report = self.verifier.verify(repo_id).await?;
        let changes = report.to_changes();
        if !changes.is_empty() {
            tracing::info!(
                "repo {}: reconciling {} diverged branches",
                repo_id,
                changes.len()
            );
        }
        self.apply_push(repo_id, &changes, self.config.system_user_id).await
    }
}
