//! The repository hosting interface. The platform only ever talks to the
//! Git host through these five operations; concrete clients (GitLab and
//! friends) live outside the core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::HostError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoUser {
    pub id: u64,
    pub username: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct CommitMetadata {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait RepoHost: Send + Sync {
    /// Fork `upstream` into the owner's namespace, returning the new repo
    /// path. Forking an already-forked repo is idempotent.
    async fn create_fork(&self, upstream: &str, owner: &str) -> Result<String, HostError>;

    async fn get_user(&self, username: &str) -> Result<RepoUser, HostError>;

    async fn push_branch(&self, repo: &str, branch: &str) -> Result<(), HostError>;

    async fn get_commit_metadata(&self, repo: &str, sha: &str)
        -> Result<CommitMetadata, HostError>;

    /// Paths touched by the given commit, relative to the repo root.
    async fn list_changed_files(&self, repo: &str, sha: &str) -> Result<Vec<String>, HostError>;
}
