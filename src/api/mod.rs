pub mod handlers;

use std::sync::Arc;
use axum::{routing::{get, post}, Router};

pub use handlers::{
    AppState, consistency, create_repo, delete_repo, get_branch, get_repo, health, list_branches,
    list_repos, post_receive, sync_repo,
};

/// Repository and branch API.
/// Branch names may contain slashes, so single-branch lookups use a catch-all
/// segment; repository-level actions live outside `/branches/` to keep the
/// routes unambiguous.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/repos", get(list_repos))
        .route(
            "/api/repos/:owner/:repo",
            get(get_repo).post(create_repo).delete(delete_repo),
        )
        .route("/api/repos/:owner/:repo/branches", get(list_branches))
        .route("/api/repos/:owner/:repo/branches/*branch", get(get_branch))
        .route("/api/repos/:owner/:repo/hooks/post-receive", post(post_receive))
        .route("/api/repos/:owner/:repo/consistency", get(consistency))
        .route("/api/repos/:owner/:repo/sync", post(sync_repo))
}
