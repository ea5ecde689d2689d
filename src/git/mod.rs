pub mod storage;

pub use storage::{CommitSummary, GitRefStore, MemoryGitStore, ObjectId};
