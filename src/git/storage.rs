//! Git ref storage.
//!
//! In-process stand-in for the git object store: per-repository refs and
//! commit objects, read by the branch sync engine through [`GitRefStore`].

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};

use crate::config::BRANCH_PREFIX;
use crate::error::{Result, ServerError};

/// A 20-byte object ID (SHA-1 hash) - Git standard format
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    /// The all-zero id git uses for "no object" in ref updates
    pub const ZERO: ObjectId = ObjectId([0u8; 20]);

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        let result = hasher.finalize();
        let mut id = [0u8; 20];
        id.copy_from_slice(&result);
        Self(id)
    }

    /// Create an ObjectId from raw 20 bytes (no hashing)
    pub fn from_raw(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 40 || !hex.is_ascii() {
            return None;
        }
        let mut id = [0u8; 20];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).ok()?;
            id[i] = u8::from_str_radix(s, 16).ok()?;
        }
        Some(Self(id))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({})", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Git object types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectType {
    Blob,
    Tree,
    Commit,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Blob => "blob",
            ObjectType::Tree => "tree",
            ObjectType::Commit => "commit",
        }
    }
}

/// A Git object stored in memory
#[derive(Clone, Debug)]
pub struct GitObject {
    pub object_type: ObjectType,
    pub data: Bytes,
}

impl GitObject {
    pub fn new(object_type: ObjectType, data: Bytes) -> Self {
        Self { object_type, data }
    }

    pub fn compute_id(&self) -> ObjectId {
        // Git object format: "<type> <size>\0<content>"
        let header = format!("{} {}\0", self.object_type.as_str(), self.data.len());
        let mut full_data = header.into_bytes();
        full_data.extend_from_slice(&self.data);
        ObjectId::from_bytes(&full_data)
    }
}

/// Subject line and committer time of a commit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitSummary {
    pub message: String,
    pub time: i64,
}

impl CommitSummary {
    /// Parse the headers and message out of a raw commit object body.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        let (headers, message) = text.split_once("\n\n").unwrap_or((text, ""));

        let mut time = None;
        for line in headers.lines() {
            if let Some(rest) = line.strip_prefix("committer ") {
                // "<name> <email> <unix-time> <tz>"
                let mut fields = rest.rsplitn(3, ' ');
                let _tz = fields.next();
                time = fields.next().and_then(|t| t.parse::<i64>().ok());
            }
        }

        Some(Self {
            message: message.lines().next().unwrap_or("").to_string(),
            time: time?,
        })
    }
}

/// Read access to the authoritative git refs of each repository.
///
/// Branch names passed in and returned are relative to `refs/heads/`.
pub trait GitRefStore: Send + Sync {
    /// All branch refs of a repository with their commits, ordered by name.
    /// Fails with `RepoNotFound` when the store holds no refs for the
    /// repository, which is not the same as a repository without branches.
    fn branch_refs(&self, repo_id: i64) -> Result<Vec<(String, ObjectId)>>;

    fn branch_commit_id(&self, repo_id: i64, branch: &str) -> Option<ObjectId>;

    fn has_object(&self, repo_id: i64, id: &ObjectId) -> bool;

    fn commit_summary(&self, repo_id: i64, id: &ObjectId) -> Option<CommitSummary>;
}

/// In-memory Git repository: objects plus refs keyed by full ref name
pub struct Repository {
    pub id: i64,
    objects: DashMap<ObjectId, GitObject>,
    /// Metadata of commits whose objects live outside this store
    summaries: DashMap<ObjectId, CommitSummary>,
    refs: RwLock<BTreeMap<String, ObjectId>>,
}

impl Repository {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            objects: DashMap::new(),
            summaries: DashMap::new(),
            refs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Store an object in the repository
    pub fn store_object(&self, object: GitObject) -> ObjectId {
        let id = object.compute_id();
        self.objects.insert(id, object);
        id
    }

    pub fn get_object(&self, id: &ObjectId) -> Option<GitObject> {
        self.objects.get(id).map(|r| r.clone())
    }

    pub fn has_object(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    /// Write a commit on top of `parent` with an empty tree.
    pub fn commit(&self, parent: Option<ObjectId>, message: &str, time: i64) -> ObjectId {
        let tree_id = self.store_object(GitObject::new(ObjectType::Tree, Bytes::new()));

        let mut body = format!("tree {}\n", tree_id);
        if let Some(parent) = parent {
            body.push_str(&format!("parent {}\n", parent));
        }
        body.push_str(&format!(
            "author Branch Sync <sync@localhost> {time} +0000\ncommitter Branch Sync <sync@localhost> {time} +0000\n\n{message}\n"
        ));

        self.store_object(GitObject::new(ObjectType::Commit, Bytes::from(body)))
    }

    pub fn get_ref(&self, name: &str) -> Option<ObjectId> {
        self.refs.read().get(name).copied()
    }

    pub fn update_ref(&self, name: &str, target: ObjectId) {
        self.refs.write().insert(name.to_string(), target);
    }

    pub fn delete_ref(&self, name: &str) -> Option<ObjectId> {
        self.refs.write().remove(name)
    }

    /// Apply one pushed ref update; an all-zero new id removes the ref.
    pub fn apply_update(&self, name: &str, new: ObjectId) {
        if new.is_zero() {
            self.delete_ref(name);
        } else {
            self.update_ref(name, new);
        }
    }

    pub fn branch_refs(&self) -> Vec<(String, ObjectId)> {
        self.refs
            .read()
            .iter()
            .filter_map(|(name, target)| {
                name.strip_prefix(BRANCH_PREFIX)
                    .map(|branch| (branch.to_string(), *target))
            })
            .collect()
    }

    /// Remember the subject and time of a commit reported by the git layer.
    pub fn record_commit_summary(&self, id: ObjectId, summary: CommitSummary) {
        self.summaries.insert(id, summary);
    }

    pub fn commit_summary(&self, id: &ObjectId) -> Option<CommitSummary> {
        match self.get_object(id) {
            Some(object) if object.object_type == ObjectType::Commit => CommitSummary::parse(&object.data),
            Some(_) => None,
            None => self.summaries.get(id).map(|s| s.clone()),
        }
    }
}

/// Repository storage manager
pub struct MemoryGitStore {
    repos: DashMap<i64, Arc<Repository>>,
}

impl MemoryGitStore {
    pub fn new() -> Self {
        Self {
            repos: DashMap::new(),
        }
    }

    pub fn get_repo(&self, repo_id: i64) -> Result<Arc<Repository>> {
        self.repos
            .get(&repo_id)
            .map(|r| r.clone())
            .ok_or_else(|| ServerError::RepoNotFound(format!("{} (no git refs loaded)", repo_id)))
    }

    pub fn get_or_create_repo(&self, repo_id: i64) -> Arc<Repository> {
        self.get_or_insert_with(repo_id, || Repository::new(repo_id))
    }

    /// Register the repository built by `init` unless one is already
    /// registered; the registered one is returned either way.
    pub fn get_or_insert_with(&self, repo_id: i64, init: impl FnOnce() -> Repository) -> Arc<Repository> {
        self.repos
            .entry(repo_id)
            .or_insert_with(|| Arc::new(init()))
            .clone()
    }

    pub fn delete_repo(&self, repo_id: i64) {
        self.repos.remove(&repo_id);
    }
}

impl Default for MemoryGitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GitRefStore for MemoryGitStore {
    fn branch_refs(&self, repo_id: i64) -> Result<Vec<(String, ObjectId)>> {
        Ok(self.get_repo(repo_id)?.branch_refs())
    }

    fn branch_commit_id(&self, repo_id: i64, branch: &str) -> Option<ObjectId> {
        let repo = self.repos.get(&repo_id)?;
        repo.get_ref(&format!("{}{}", BRANCH_PREFIX, branch))
    }

    fn has_object(&self, repo_id: i64, id: &ObjectId) -> bool {
        self.repos
            .get(&repo_id)
            .map(|repo| repo.has_object(id))
            .unwrap_or(false)
    }

    fn commit_summary(&self, repo_id: i64, id: &ObjectId) -> Option<CommitSummary> {
        self.repos.get(&repo_id)?.commit_summary(id)
    }
}
