//! Compares the branch table with the git refs of a repository.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{Branch, BranchStore, RefChange};
use crate::error::Result;
use crate::git::{GitRefStore, ObjectId};

/// Differences between git and the live branch records of one repository
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub repo_id: i64,
    /// Branches present in git without a live record
    pub missing: Vec<(String, ObjectId)>,
    /// Live records whose branch no longer exists in git
    pub stale: Vec<Branch>,
    /// Live records at a different commit than git (record, git head)
    pub mismatched: Vec<(Branch, ObjectId)>,
}

impl ConsistencyReport {
    /// `records` may include soft-deleted rows; they count as absent.
    pub fn compare(repo_id: i64, git_refs: &[(String, ObjectId)], records: &[Branch]) -> Self {
        let by_name: HashMap<&str, &Branch> = records.iter().map(|b| (b.name.as_str(), b)).collect();
        let in_git: HashSet<&str> = git_refs.iter().map(|(name, _)| name.as_str()).collect();
        let mut report = ConsistencyReport {
            repo_id,
            ..Default::default()
        };

        for (name, head) in git_refs {
            match by_name.get(name.as_str()) {
                Some(record) if record.is_active() => {
                    if record.commit.id != *head {
                        report.mismatched.push(((*record).clone(), *head));
                    }
                }
                _ => report.missing.push((name.clone(), *head)),
            }
        }

        report.stale = records
            .iter()
            .filter(|b| b.is_active() && !in_git.contains(b.name.as_str()))
            .cloned()
            .collect();

        report
    }

    pub fn is_converged(&self) -> bool {
        self.missing.is_empty() && self.stale.is_empty() && self.mismatched.is_empty()
    }

    /// Ref changes that would bring the records in line with git: creates
    /// and updates ordered by branch name, then deletions.
    pub fn to_changes(&self) -> Vec<RefChange> {
        let mut changes: Vec<RefChange> = self
            .missing
            .iter()
            .map(|(name, head)| RefChange::create(name.as_str(), *head))
            .chain(
                self.mismatched
                    .iter()
                    .map(|(record, head)| RefChange::update(record.name.as_str(), record.commit.id, *head)),
            )
            .collect();
        changes.sort_by(|a, b| a.branch_name.cmp(&b.branch_name));

        let mut deletions: Vec<RefChange> = self
            .stale
            .iter()
            .map(|record| RefChange::delete(record.name.as_str(), record.commit.id))
            .collect();
        deletions.sort_by(|a, b| a.branch_name.cmp(&b.branch_name));

        changes.extend(deletions);
        changes
    }
}

/// Read path used to check that a repository's branch table matches git.
#[derive(Clone)]
pub struct ConsistencyVerifier {
    store: BranchStore,
    git: Arc<dyn GitRefStore>,
}

impl ConsistencyVerifier {
    pub fn new(store: BranchStore, git: Arc<dyn GitRefStore>) -> Self {
        Self { store, git }
    }

    /// The reconciled branch set: every live record, ordered by name.
    pub async fn reconciled_branches(&self, repo_id: i64) -> Result<Vec<Branch>> {
        self.store.list_non_deleted(repo_id).await
    }

    /// Fails when the git store does not know the repository; an unknown
    /// ref set must never read as "every branch was removed".
    pub async fn verify(&self, repo_id: i64) -> Result<ConsistencyReport> {
        let records = self.store.list_all(repo_id).await?;
        let git_refs = self.git.branch_refs(repo_id)?;
        let report = ConsistencyReport::compare(repo_id, &git_refs, &records);

        if !report.is_converged() {
            tracing::debug!(
                "repo {} diverged from git: {} missing, {} stale, {} mismatched",
                repo_id,
                report.missing.len(),
                report.stale.len(),
                report.mismatched.len()
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{BranchCommit, BranchState, RefChangeKind};

    fn oid(n: u8) -> ObjectId {
        ObjectId::from_raw([n; 20])
    }

    fn record(name: &str, head: u8, state: BranchState) -> Branch {
        Branch {
            repo_id: 1,
            name: name.to_string(),
            commit: BranchCommit {
                id: oid(head),
                message: String::new(),
                time: 0,
                pusher_id: 1,
            },
            state,
        }
    }

    #[test]
    fn test_converged() {
        let git = vec![("main".to_string(), oid(1))];
        let records = vec![
            record("main", 1, BranchState::Active),
            record("old", 2, BranchState::Deleted { deleted_by: 1, deleted_unix: 1 }),
        ];
        assert!(ConsistencyReport::compare(1, &git, &records).is_converged());
    }

    #[test]
    fn test_divergence_and_repair_plan() {
        let git = vec![
            ("a-new".to_string(), oid(1)),
            ("main".to_string(), oid(3)),
            ("revived".to_string(), oid(4)),
        ];
        let records = vec![
            record("gone", 2, BranchState::Active),
            record("main", 1, BranchState::Active),
            record("revived", 4, BranchState::Deleted { deleted_by: 1, deleted_unix: 1 }),
        ];

        let report = ConsistencyReport::compare(1, &git, &records);
        assert!(!report.is_converged());
        assert_eq!(report.missing.len(), 2);
        assert_eq!(report.stale.len(), 1);
        assert_eq!(report.mismatched.len(), 1);

        let plan: Vec<(String, RefChangeKind)> = report
            .to_changes()
            .into_iter()
            .map(|c| (c.branch_name, c.kind))
            .collect();
        assert_eq!(
            plan,
            vec![
                ("a-new".to_string(), RefChangeKind::Create),
                ("main".to_string(), RefChangeKind::Update),
                ("revived".to_string(), RefChangeKind::Create),
                ("gone".to_string(), RefChangeKind::Delete),
            ]
        );
    }
}
