//! Server and sync configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Namespace under which git keeps branch refs.
pub const BRANCH_PREFIX: &str = "refs/heads/";

/// Settings the branch sync engine and default-branch resolver need.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Ref namespace that holds branches
    pub branch_prefix: String,
    /// Names tried, in order, when a repository needs a new default branch
    pub fallback_branches: Vec<String>,
    /// Pusher/deleter id recorded by reconciliation runs
    pub system_user_id: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            branch_prefix: BRANCH_PREFIX.to_string(),
            fallback_branches: vec!["main".to_string(), "master".to_string()],
            system_user_id: 0,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding the SQLite database
    pub storage_path: PathBuf,
    /// Address the HTTP server listens on
    pub bind_addr: SocketAddr,
    /// Default branch name given to newly created repositories
    pub default_branch: String,
    pub sync: SyncConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            storage_path: std::env::temp_dir().join("branch-sync-storage"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            default_branch: "main".to_string(),
            sync: SyncConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build config from `BRANCH_SYNC_*` environment variables, falling back
    /// to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("BRANCH_SYNC_STORAGE_PATH") {
            config.storage_path = PathBuf::from(path);
        }

        if let Some(addr) = lookup("BRANCH_SYNC_BIND") {
            match addr.parse() {
                Ok(addr) => config.bind_addr = addr,
                Err(e) => tracing::warn!("Ignoring BRANCH_SYNC_BIND={}: {}", addr, e),
            }
        }

        if let Some(name) = lookup("BRANCH_SYNC_DEFAULT_BRANCH") {
            if !name.trim().is_empty() {
                config.default_branch = name.trim().to_string();
            }
        }

        if let Some(list) = lookup("BRANCH_SYNC_FALLBACK_BRANCHES") {
            config.sync.fallback_branches = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(id) = lookup("BRANCH_SYNC_SYSTEM_USER") {
            match id.parse() {
                Ok(id) => config.sync.system_user_id = id,
                Err(e) => tracing::warn!("Ignoring BRANCH_SYNC_SYSTEM_USER={}: {}", id, e),
            }
        }

        config
    }

    /// Path of the SQLite database file
    pub fn database_path(&self) -> PathBuf {
        self.storage_path.join("branch-sync.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(|_| None);
        assert_eq!(config.default_branch, "main");
        assert_eq!(config.sync.branch_prefix, "refs/heads/");
        assert_eq!(config.sync.fallback_branches, vec!["main", "master"]);
        assert_eq!(config.bind_addr.port(), 8080);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("BRANCH_SYNC_STORAGE_PATH", "/srv/sync"),
            ("BRANCH_SYNC_BIND", "0.0.0.0:9000"),
            ("BRANCH_SYNC_FALLBACK_BRANCHES", "trunk, develop,,"),
            ("BRANCH_SYNC_SYSTEM_USER", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.storage_path, PathBuf::from("/srv/sync"));
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.sync.fallback_branches, vec!["trunk", "develop"]);
        // Bad value keeps the default
        assert_eq!(config.sync.system_user_id, 0);
        assert_eq!(config.database_path(), PathBuf::from("/srv/sync/branch-sync.db"));
    }
}
