//! Turns the ref updates reported by a push into per-branch changes.

use serde::Deserialize;

use crate::error::{Result, ServerError};
use crate::git::ObjectId;

/// One `<old> <new> <ref>` line as reported by the transport
#[derive(Clone, Debug, Deserialize)]
pub struct RawRefUpdate {
    pub ref_name: String,
    pub old_oid: String,
    pub new_oid: String,
}

impl RawRefUpdate {
    pub fn new(ref_name: impl Into<String>, old: ObjectId, new: ObjectId) -> Self {
        Self {
            ref_name: ref_name.into(),
            old_oid: old.to_hex(),
            new_oid: new.to_hex(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefChangeKind {
    Create,
    Update,
    Delete,
}

impl RefChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefChangeKind::Create => "create",
            RefChangeKind::Update => "update",
            RefChangeKind::Delete => "delete",
        }
    }
}

/// A classified change to a single branch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefChange {
    pub branch_name: String,
    pub kind: RefChangeKind,
    pub old_commit: ObjectId,
    pub new_commit: ObjectId,
}

impl RefChange {
    pub fn create(branch_name: impl Into<String>, new_commit: ObjectId) -> Self {
        Self {
            branch_name: branch_name.into(),
            kind: RefChangeKind::Create,
            old_commit: ObjectId::ZERO,
            new_commit,
        }
    }

    pub fn update(branch_name: impl Into<String>, old_commit: ObjectId, new_commit: ObjectId) -> Self {
        Self {
            branch_name: branch_name.into(),
            kind: RefChangeKind::Update,
            old_commit,
            new_commit,
        }
    }

    pub fn delete(branch_name: impl Into<String>, old_commit: ObjectId) -> Self {
        Self {
            branch_name: branch_name.into(),
            kind: RefChangeKind::Delete,
            old_commit,
            new_commit: ObjectId::ZERO,
        }
    }
}

/// Result of extracting one push: usable changes in payload order, plus the
/// refs that were skipped as malformed.
#[derive(Debug, Default)]
pub struct Extraction {
    pub changes: Vec<RefChange>,
    pub rejected: Vec<ServerError>,
}

/// Classify every branch ref update of a push. Refs outside `prefix` are
/// ignored; malformed ones are logged and collected in `rejected`.
pub fn extract_ref_changes(updates: &[RawRefUpdate], prefix: &str) -> Extraction {
    let mut extraction = Extraction::default();

    for update in updates {
        match classify(update, prefix) {
            Ok(Some(change)) => {
                tracing::debug!(
                    "ref change: {} {} {} -> {}",
                    change.kind.as_str(),
                    change.branch_name,
                    change.old_commit,
                    change.new_commit
                );
                extraction.changes.push(change);
            }
            Ok(None) => {
                tracing::debug!("skipping non-branch ref {}", update.ref_name);
            }
            Err(e) => {
                tracing::warn!("skipping ref update: {}", e);
                extraction.rejected.push(e);
            }
        }
    }

    extraction
}

/// Classify a single update. `Ok(None)` means the ref is not a branch.
pub fn classify(update: &RawRefUpdate, prefix: &str) -> Result<Option<RefChange>> {
    let Some(branch_name) = update.ref_name.strip_prefix(prefix) else {
        return Ok(None);
    };

    validate_branch_name(branch_name)
        .map_err(|reason| ServerError::malformed_ref(&update.ref_name, reason))?;

    let old = ObjectId::from_hex(&update.old_oid).ok_or_else(|| {
        ServerError::malformed_ref(&update.ref_name, format!("bad old object id {:?}", update.old_oid))
    })?;
    let new = ObjectId::from_hex(&update.new_oid).ok_or_else(|| {
        ServerError::malformed_ref(&update.ref_name, format!("bad new object id {:?}", update.new_oid))
    })?;

    let change = match (old.is_zero(), new.is_zero()) {
        (true, true) => {
            return Err(ServerError::malformed_ref(
                &update.ref_name,
                "old and new object ids are both zero",
            ))
        }
        (true, false) => RefChange::create(branch_name, new),
        (false, true) => RefChange::delete(branch_name, old),
        (false, false) => RefChange::update(branch_name, old, new),
    };

    Ok(Some(change))
}

/// Check a branch name against git's ref-name rules.
pub fn validate_branch_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty branch name");
    }
    if name == "@" {
        return Err("'@' is not a valid name");
    }
    if name.starts_with('-') {
        return Err("starts with '-'");
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return Err("misplaced '/'");
    }
    if name.ends_with('.') {
        return Err("ends with '.'");
    }
    if name.contains("..") {
        return Err("contains '..'");
    }
    if name.contains("@{") {
        return Err("contains '@{'");
    }
    if name
        .chars()
        .any(|c| c.is_ascii_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return Err("contains a forbidden character");
    }
    for component in name.split('/') {
        if component.starts_with('.') {
            return Err("component starts with '.'");
        }
        if component.ends_with(".lock") {
            return Err("component ends with '.lock'");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "refs/heads/";

    fn oid(n: u8) -> ObjectId {
        ObjectId::from_raw([n; 20])
    }

    #[test]
    fn test_classification() {
        let updates = vec![
            RawRefUpdate::new("refs/heads/new", ObjectId::ZERO, oid(1)),
            RawRefUpdate::new("refs/heads/ff", oid(1), oid(2)),
            RawRefUpdate::new("refs/heads/gone", oid(2), ObjectId::ZERO),
        ];

        let extraction = extract_ref_changes(&updates, PREFIX);
        assert!(extraction.rejected.is_empty());
        assert_eq!(
            extraction.changes,
            vec![
                RefChange::create("new", oid(1)),
                RefChange::update("ff", oid(1), oid(2)),
                RefChange::delete("gone", oid(2)),
            ]
        );
    }

    #[test]
    fn test_tags_are_ignored() {
        let updates = vec![
            RawRefUpdate::new("refs/tags/v1.0", ObjectId::ZERO, oid(1)),
            RawRefUpdate::new("HEAD", oid(1), oid(2)),
            RawRefUpdate::new("refs/heads/feature/login", ObjectId::ZERO, oid(3)),
        ];

        let extraction = extract_ref_changes(&updates, PREFIX);
        assert_eq!(extraction.changes.len(), 1);
        assert_eq!(extraction.changes[0].branch_name, "feature/login");
        assert!(extraction.rejected.is_empty());
    }

    #[test]
    fn test_duplicates_keep_payload_order() {
        let updates = vec![
            RawRefUpdate::new("refs/heads/dup", oid(1), oid(2)),
            RawRefUpdate::new("refs/heads/dup", oid(2), oid(3)),
        ];

        let changes = extract_ref_changes(&updates, PREFIX).changes;
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].new_commit, oid(3));
    }

    #[test]
    fn test_malformed_refs_are_skipped() {
        let updates = vec![
            RawRefUpdate::new("refs/heads/a..b", ObjectId::ZERO, oid(1)),
            RawRefUpdate::new("refs/heads/", ObjectId::ZERO, oid(1)),
            RawRefUpdate::new("refs/heads/both-zero", ObjectId::ZERO, ObjectId::ZERO),
            RawRefUpdate {
                ref_name: "refs/heads/bad-oid".to_string(),
                old_oid: "xyz".to_string(),
                new_oid: oid(1).to_hex(),
            },
            RawRefUpdate::new("refs/heads/ok", ObjectId::ZERO, oid(1)),
        ];

        let extraction = extract_ref_changes(&updates, PREFIX);
        assert_eq!(extraction.changes, vec![RefChange::create("ok", oid(1))]);
        assert_eq!(extraction.rejected.len(), 4);
        assert!(extraction
            .rejected
            .iter()
            .all(|e| matches!(e, ServerError::MalformedRef { .. })));
    }

    #[test]
    fn test_branch_name_rules() {
        for good in ["main", "feature/x", "release-1.2", "user@host", "a.b/c_d", "fix/-x"] {
            assert!(validate_branch_name(good).is_ok(), "{good} should be valid");
        }
        for bad in [
            "", "@", "/lead", "trail/", "a//b", "end.", "a..b", "x@{1}", "sp ace",
            "til~de", "col:on", "q?", "st*r", "br[ack", "back\\slash", ".hidden",
            "dir/.hidden", "topic.lock", "a/b.lock/c", "tab\tname", "-f", "--force",
        ] {
            assert!(validate_branch_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
