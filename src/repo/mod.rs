/// Repository storage boundary
///
/// The relay does not interpret repository contents itself. A `RepoStore`
/// stages a fetched repository revision and reports which events it produced
/// and which other identities the content refers to. The head only moves to
/// the staged revision once the caller has sequenced those events.
pub mod sqlite;

pub use sqlite::SqliteRepoStore;

use crate::{error::RelayError, sequencer::RepoEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// A repository revision downloaded from its source
#[derive(Debug, Clone)]
pub struct FetchedRepo {
    pub did: String,
    pub rev: String,
    pub host: String,
    pub body: Vec<u8>,
}

/// Outcome of staging a fetched revision
#[derive(Debug, Clone, Default)]
pub struct AppliedRepo {
    /// Events to sequence, empty when the revision was already known
    pub events: Vec<RepoEvent>,
    /// Other DIDs referenced by the content
    pub references: Vec<String>,
    /// Where the head moves once `events` are sequenced
    pub head: Option<StagedHead>,
}

/// A head position that has been stored but not yet published
#[derive(Debug, Clone, PartialEq)]
pub struct StagedHead {
    pub did: String,
    pub rev: String,
    pub commit_id: String,
    pub host: String,
}

/// Current revision of a stored repository
#[derive(Debug, Clone, PartialEq)]
pub struct RepoHead {
    pub did: String,
    pub rev: String,
    pub commit_id: String,
    pub host: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub repos_compacted: u64,
    pub snapshots_removed: u64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepoStoreError {
    /// The content is malformed; retrying cannot help
    #[error("Invalid repository: {0}")]
    Invalid(String),

    /// Storage failed; the same input may succeed later
    #[error("Repository storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for RepoStoreError {
    fn from(err: sqlx::Error) -> Self {
        RepoStoreError::Storage(err.to_string())
    }
}

impl From<RepoStoreError> for RelayError {
    fn from(err: RepoStoreError) -> Self {
        match err {
            RepoStoreError::Invalid(msg) => RelayError::Validation(msg),
            RepoStoreError::Storage(msg) => RelayError::Internal(msg),
        }
    }
}

#[async_trait]
pub trait RepoStore: Send + Sync {
    /// Store a fetched revision without moving the head.
    /// Revisions not newer than the head produce no events.
    async fn stage(&self, repo: FetchedRepo) -> Result<AppliedRepo, RepoStoreError>;

    /// Move the head to a staged revision. Returns false if the head is
    /// already at or past it.
    async fn advance(&self, head: &StagedHead) -> Result<bool, RepoStoreError>;

    async fn head(&self, did: &str) -> Result<Option<RepoHead>, RepoStoreError>;

    async fn take_down(&self, did: &str) -> Result<(), RepoStoreError>;

    async fn reverse_take_down(&self, did: &str) -> Result<(), RepoStoreError>;

    async fn is_taken_down(&self, did: &str) -> Result<bool, RepoStoreError>;

    /// Drop data superseded by newer revisions
    async fn compact(&self) -> Result<CompactionStats, RepoStoreError>;
}
