/// Persistence backend contract for the event log
use crate::{
    error::RelayResult,
    sequencer::{RepoEvent, SequencedEvent},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// One page of replayed events
#[derive(Debug, Clone, Default)]
pub struct PlaybackPage {
    pub events: Vec<SequencedEvent>,
    /// Last sequence number examined; resume the next page after it.
    /// Can be past the last returned event when taken-down repos were skipped.
    pub next_cursor: i64,
}

/// Result of a retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimStats {
    pub events_removed: u64,
    /// Highest sequence number no longer replayable
    pub trimmed_through: i64,
}

/// Durable, replayable event storage
///
/// Backends assign sequence numbers: strictly increasing, never reused, even
/// across restarts and after retention removed every event.
#[async_trait]
pub trait EventPersistence: Send + Sync {
    /// Assign the next sequence number and durably record the event
    async fn persist(&self, event: RepoEvent) -> RelayResult<SequencedEvent>;

    /// Events with `seq > since` in ascending order, at most `limit` of them.
    /// Fails with `ExpiredCursor` when `since` predates retained history.
    async fn playback(&self, since: i64, limit: usize) -> RelayResult<PlaybackPage>;

    /// Highest sequence number assigned so far (0 when none)
    async fn last_seq(&self) -> RelayResult<i64>;

    /// Drop events older than `before`
    async fn trim(&self, before: DateTime<Utc>) -> RelayResult<TrimStats>;

    /// Hide a repository's events from replay
    async fn take_down_repo(&self, did: &str) -> RelayResult<()>;

    /// Retention window applied by scheduled trimming, if any
    fn retention(&self) -> Option<Duration>;

    async fn flush(&self) -> RelayResult<()>;

    async fn shutdown(&self) -> RelayResult<()>;
}
