use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::branch::{extract_ref_changes, Branch, BranchState, BranchSyncEngine, PushOutcome, RawRefUpdate};
use crate::config::ServerConfig;
use crate::db::entities::repository;
use crate::error::Result;
use crate::git::storage::Repository as GitRepository;
use crate::git::{CommitSummary, MemoryGitStore, ObjectId};
use crate::repo::RepoService;

/// Application state shared across handlers
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub repos: RepoService,
    pub engine: BranchSyncEngine,
    /// Mirror of the git refs, fed by the post-receive hook
    pub git: Arc<MemoryGitStore>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(db: Arc<DatabaseConnection>, config: ServerConfig) -> Self {
        let git = Arc::new(MemoryGitStore::new());
        Self {
            repos: RepoService::new(db.clone()),
            engine: BranchSyncEngine::new(db.clone(), git.clone(), config.sync.clone()),
            db,
            git,
            config,
        }
    }

    /// The git ref mirror of a repository. A mirror lost to a restart is
    /// rebuilt from the live branch records before new updates land on it.
    async fn git_mirror(&self, repo_id: i64) -> Result<Arc<GitRepository>> {
        if let Ok(mirror) = self.git.get_repo(repo_id) {
            return Ok(mirror);
        }

        let branches = self.engine.verifier().reconciled_branches(repo_id).await?;
        let prefix = &self.config.sync.branch_prefix;
        // A concurrent push may have registered the mirror meanwhile; its
        // copy wins and this seed is dropped.
        let mirror = self.git.get_or_insert_with(repo_id, || {
            let seeded = GitRepository::new(repo_id);
            for branch in &branches {
                seeded.update_ref(&format!("{}{}", prefix, branch.name), branch.commit.id);
                seeded.record_commit_summary(
                    branch.commit.id,
                    CommitSummary {
                        message: branch.commit.message.clone(),
                        time: branch.commit.time,
                    },
                );
            }
            tracing::info!("repo {}: rebuilt git mirror from {} branches", repo_id, branches.len());
            seeded
        });
        Ok(mirror)
    }
}

fn json_response(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

fn repo_json(repo: &repository::Model) -> Value {
    json!({
        "id": repo.id,
        "owner": repo.owner,
        "name": repo.name,
        "default_branch": repo.default_branch,
        "num_branches": repo.num_branches,
        "created_at": repo.created_at,
    })
}

fn branch_json(branch: &Branch) -> Value {
    let (deleted_by, deleted_unix) = match branch.state {
        BranchState::Active => (None, None),
        BranchState::Deleted { deleted_by, deleted_unix } => (Some(deleted_by), Some(deleted_unix)),
    };
    json!({
        "name": branch.name,
        "commit_id": branch.commit.id.to_hex(),
        "commit_message": branch.commit.message,
        "commit_time": branch.commit.time,
        "pusher_id": branch.commit.pusher_id,
        "is_deleted": branch.is_deleted(),
        "deleted_by_id": deleted_by,
        "deleted_unix": deleted_unix,
    })
}

fn outcome_json(outcome: &PushOutcome) -> Value {
    json!({
        "updated": outcome.updated,
        "deleted": outcome.deleted,
        "failed": outcome
            .failed
            .iter()
            .map(|f| json!({ "branch": f.branch, "error": f.error }))
            .collect::<Vec<_>>(),
        "default_branch": outcome.default_branch,
        "num_branches": outcome.num_branches,
    })
}

/// GET /api/repos - List repositories
pub async fn list_repos(State(state): State<Arc<AppState>>) -> Result<Response> {
    let repos = state.repos.list().await?;
    let repos: Vec<Value> = repos.iter().map(repo_json).collect();
    Ok(json_response(StatusCode::OK, json!({ "repos": repos })))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateRepoRequest {
    pub default_branch: Option<String>,
}

/// POST /api/repos/:owner/:repo - Create repository
pub async fn create_repo(
    State(state): State<Arc<AppState>>,
    Path((owner, repo_name)): Path<(String, String)>,
    body: Option<Json<CreateRepoRequest>>,
) -> Result<Response> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let default_branch = request
        .default_branch
        .unwrap_or_else(|| state.config.default_branch.clone());

    let repo = state.repos.create(&owner, &repo_name, Some(&default_branch)).await?;
    state.git.get_or_create_repo(repo.id);

    Ok(json_response(StatusCode::CREATED, repo_json(&repo)))
}

/// GET /api/repos/:owner/:repo - Repository with its branch aggregates
pub async fn get_repo(
    State(state): State<Arc<AppState>>,
    Path((owner, repo_name)): Path<(String, String)>,
) -> Result<Response> {
    let repo = state.repos.find(&owner, &repo_name).await?;
    Ok(json_response(StatusCode::OK, repo_json(&repo)))
}

/// DELETE /api/repos/:owner/:repo - Delete repository and purge its branches
pub async fn delete_repo(
    State(state): State<Arc<AppState>>,
    Path((owner, repo_name)): Path<(String, String)>,
) -> Result<Response> {
    let repo = state.repos.find(&owner, &repo_name).await?;
    state.repos.delete(repo.id).await?;
    state.git.delete_repo(repo.id);

    Ok(json_response(
        StatusCode::OK,
        json!({ "message": format!("Repository '{}' deleted", repo.full_name()) }),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListBranchesQuery {
    #[serde(default)]
    pub include_deleted: bool,
}

/// GET /api/repos/:owner/:repo/branches
pub async fn list_branches(
    State(state): State<Arc<AppState>>,
    Path((owner, repo_name)): Path<(String, String)>,
    Query(query): Query<ListBranchesQuery>,
) -> Result<Response> {
    let repo = state.repos.find(&owner, &repo_name).await?;
    let branches = if query.include_deleted {
        state.engine.store().list_all(repo.id).await?
    } else {
        state.engine.verifier().reconciled_branches(repo.id).await?
    };

    let branches: Vec<Value> = branches.iter().map(branch_json).collect();
    Ok(json_response(
        StatusCode::OK,
        json!({
            "default_branch": repo.default_branch,
            "num_branches": repo.num_branches,
            "branches": branches,
        }),
    ))
}

/// GET /api/repos/:owner/:repo/branches/*branch
pub async fn get_branch(
    State(state): State<Arc<AppState>>,
    Path((owner, repo_name, branch)): Path<(String, String, String)>,
) -> Result<Response> {
    let repo = state.repos.find(&owner, &repo_name).await?;
    let branch = state.engine.store().get(repo.id, &branch).await?;
    Ok(json_response(StatusCode::OK, branch_json(&branch)))
}

/// Subject and committer time of a pushed commit
#[derive(Debug, Deserialize)]
pub struct PushedCommit {
    pub id: String,
    pub message: String,
    pub time: i64,
}

/// Ref updates of an accepted push, as sent by the git layer's hook
#[derive(Debug, Deserialize)]
pub struct PostReceivePayload {
    pub pusher_id: i64,
    pub updates: Vec<RawRefUpdate>,
    /// Metadata of the new heads. Heads the git store cannot describe
    /// otherwise get an empty message at push time.
    #[serde(default)]
    pub commits: Vec<PushedCommit>,
}

/// POST /api/repos/:owner/:repo/hooks/post-receive
///
/// Malformed refs are reported back but do not fail the push; neither do
/// per-branch write failures, which show up under `failed`.
pub async fn post_receive(
    State(state): State<Arc<AppState>>,
    Path((owner, repo_name)): Path<(String, String)>,
    Json(payload): Json<PostReceivePayload>,
) -> Result<Response> {
    let repo = state.repos.find(&owner, &repo_name).await?;
    let prefix = &state.config.sync.branch_prefix;
    let extraction = extract_ref_changes(&payload.updates, prefix);

    let git_repo = state.git_mirror(repo.id).await?;
    for commit in &payload.commits {
        match ObjectId::from_hex(&commit.id) {
            Some(id) => git_repo.record_commit_summary(
                id,
                CommitSummary {
                    message: commit.message.lines().next().unwrap_or("").to_string(),
                    time: commit.time,
                },
            ),
            None => tracing::warn!("ignoring metadata for bad commit id {:?}", commit.id),
        }
    }
    for change in &extraction.changes {
        git_repo.apply_update(&format!("{}{}", prefix, change.branch_name), change.new_commit);
    }

    let outcome = state
        .engine
        .apply_push(repo.id, &extraction.changes, payload.pusher_id)
        .await?;

    let mut body = outcome_json(&outcome);
    body["rejected"] = json!(extraction
        .rejected
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>());

    Ok(json_response(StatusCode::OK, body))
}

/// GET /api/repos/:owner/:repo/consistency
pub async fn consistency(
    State(state): State<Arc<AppState>>,
    Path((owner, repo_name)): Path<(String, String)>,
) -> Result<Response> {
    let repo = state.repos.find(&owner, &repo_name).await?;
    let report = state.engine.verifier().verify(repo.id).await?;

    Ok(json_response(
        StatusCode::OK,
        json!({
            "converged": report.is_converged(),
            "missing": report.missing.iter().map(|(name, head)| json!({
                "name": name,
                "git_commit": head.to_hex(),
            })).collect::<Vec<_>>(),
            "stale": report.stale.iter().map(|b| b.name.clone()).collect::<Vec<_>>(),
            "mismatched": report.mismatched.iter().map(|(b, head)| json!({
                "name": b.name,
                "record_commit": b.commit.id.to_hex(),
                "git_commit": head.to_hex(),
            })).collect::<Vec<_>>(),
        }),
    ))
}

/// POST /api/repos/:owner/:repo/sync - Reconcile the branch table with git
pub async fn sync_repo(
    State(state): State<Arc<AppState>>,
    Path((owner, repo_name)): Path<(String, String)>,
) -> Result<Response> {
    let repo = state.repos.find(&owner, &repo_name).await?;
    let outcome = state.engine.reconcile(repo.id).await?;
    Ok(json_response(StatusCode::OK, outcome_json(&outcome)))
}

/// Health check endpoint
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.db.ping().await {
        Ok(()) => json_response(
            StatusCode::OK,
            json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION")
            }),
        ),
        Err(e) => {
            tracing::error!("health check failed: {}", e);
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "status": "unhealthy", "error": e.to_string() }),
            )
        }
    }
}
