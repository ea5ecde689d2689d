//! Branch records and their reconciliation against git refs.
//!
//! A push flows through [`change`] (raw ref updates to classified changes),
//! then [`sync`] (per-branch writes through [`store`], aggregate refresh and
//! [`default_branch`] resolution). [`verify`] compares the result with the
//! git ref store.

pub mod change;
pub mod default_branch;
pub mod store;
pub mod sync;
pub mod verify;

use std::time::{SystemTime, UNIX_EPOCH};

use crate::db::entities::branch;
use crate::error::ServerError;
use crate::git::ObjectId;

pub use change::{extract_ref_changes, RawRefUpdate, RefChange, RefChangeKind};
pub use default_branch::DefaultBranchResolver;
pub use store::BranchStore;
pub use sync::{BranchSyncEngine, PushOutcome};
pub use verify::{ConsistencyReport, ConsistencyVerifier};

/// Lifecycle of a branch row. Recreating a deleted branch moves the same
/// row back to `Active`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchState {
    Active,
    Deleted { deleted_by: i64, deleted_unix: i64 },
}

/// Head commit of a branch and who pushed it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchCommit {
    pub id: ObjectId,
    pub message: String,
    pub time: i64,
    pub pusher_id: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Branch {
    pub repo_id: i64,
    pub name: String,
    pub commit: BranchCommit,
    pub state: BranchState,
}

impl Branch {
    pub fn is_active(&self) -> bool {
        self.state == BranchState::Active
    }

    pub fn is_deleted(&self) -> bool {
        !self.is_active()
    }
}

impl TryFrom<branch::Model> for Branch {
    type Error = ServerError;

    fn try_from(model: branch::Model) -> Result<Self, Self::Error> {
        let id = ObjectId::from_hex(&model.commit_id).ok_or_else(|| {
            ServerError::Internal(format!(
                "branch {} of repo {} has corrupt commit id {:?}",
                model.name, model.repo_id, model.commit_id
            ))
        })?;

        // Rows written before the audit columns existed may lack them
        let state = if model.is_deleted {
            BranchState::Deleted {
                deleted_by: model.deleted_by_id.unwrap_or_default(),
                deleted_unix: model.deleted_unix.unwrap_or_default(),
            }
        } else {
            BranchState::Active
        };

        Ok(Branch {
            repo_id: model.repo_id,
            name: model.name,
            commit: BranchCommit {
                id,
                message: model.commit_message,
                time: model.commit_time,
                pusher_id: model.pusher_id,
            },
            state,
        })
    }
}

/// Current time as unix seconds
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(is_deleted: bool, commit_id: &str) -> branch::Model {
        branch::Model {
            id: 1,
            repo_id: 3,
            name: "main".to_string(),
            commit_id: commit_id.to_string(),
            commit_message: "msg".to_string(),
            commit_time: 10,
            pusher_id: 2,
            is_deleted,
            deleted_by_id: is_deleted.then_some(5),
            deleted_unix: is_deleted.then_some(99),
        }
    }

    #[test]
    fn test_row_to_branch_state() {
        let hex = "a".repeat(40);
        let active = Branch::try_from(model(false, &hex)).unwrap();
        assert!(active.is_active());
        assert_eq!(active.commit.id.to_hex(), hex);

        let deleted = Branch::try_from(model(true, &hex)).unwrap();
        assert_eq!(
            deleted.state,
            BranchState::Deleted { deleted_by: 5, deleted_unix: 99 }
        );
    }

    #[test]
    fn test_corrupt_commit_id() {
        let err = Branch::try_from(model(false, "not-a-sha")).unwrap_err();
        assert!(matches!(err, ServerError::Internal(_)));
    }
}
