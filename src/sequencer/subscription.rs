/// Firehose subscription stream
use crate::{
    error::{RelayError, RelayResult},
    metrics,
    sequencer::{persist::EventPersistence, SequencedEvent},
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Replay of `(cursor, head]` from persistence
pub(crate) struct Replay {
    persister: Arc<dyn EventPersistence>,
    cursor: i64,
    head: i64,
    batch: usize,
    buffered: VecDeque<SequencedEvent>,
}

impl Replay {
    pub(crate) fn new(persister: Arc<dyn EventPersistence>, cursor: i64, head: i64, batch: usize) -> Self {
        Self {
            persister,
            cursor,
            head,
            batch,
            buffered: VecDeque::new(),
        }
    }

    fn done(&self) -> bool {
        self.buffered.is_empty() && self.cursor >= self.head
    }

    /// Load the next page; state only changes once the read succeeds
    async fn load_page(&mut self) -> RelayResult<()> {
        let page = self.persister.playback(self.cursor, self.batch).await?;

        let before = self.buffered.len();
        self.buffered.extend(page.events.into_iter().filter(|e| e.seq <= self.head));
        metrics::FIREHOSE_REPLAYED_EVENTS_TOTAL.inc_by((self.buffered.len() - before) as u64);

        self.cursor = if page.next_cursor > self.cursor {
            page.next_cursor.min(self.head)
        } else {
            // Nothing left below the head
            self.head
        };
        Ok(())
    }
}

/// One subscriber's ordered event stream
///
/// Yields replayed events first, then live ones. A subscriber dropped for
/// lagging gets its buffered events followed by a single
/// `RelayError::ConsumerTooSlow`. `next` is cancel-safe.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<SequencedEvent>,
    dropped: Arc<AtomicBool>,
    replay: Option<Replay>,
    finished: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("replaying", &self.replay.is_some())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        rx: mpsc::Receiver<SequencedEvent>,
        dropped: Arc<AtomicBool>,
        replay: Option<Replay>,
    ) -> Self {
        Self {
            id,
            rx,
            dropped,
            replay,
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_replaying(&self) -> bool {
        self.replay.is_some()
    }

    /// Read the first replay page
    pub(crate) async fn prefetch(&mut self) -> RelayResult<()> {
        match self.replay.as_mut() {
            Some(replay) if !replay.done() => replay.load_page().await,
            _ => Ok(()),
        }
    }

    /// Next event, `None` once the stream has ended
    pub async fn next(&mut self) -> Option<RelayResult<SequencedEvent>> {
        if self.finished {
            return None;
        }

        while let Some(replay) = self.replay.as_mut() {
            if let Some(evt) = replay.buffered.pop_front() {
                return Some(Ok(evt));
            }
            if replay.done() {
                self.replay = None;
                break;
            }
            if let Err(e) = replay.load_page().await {
                self.replay = None;
                self.finished = true;
                return Some(Err(e));
            }
        }

        match self.rx.recv().await {
            Some(evt) => Some(Ok(evt)),
            None => {
                self.finished = true;
                if self.dropped.load(Ordering::SeqCst) {
                    Some(Err(RelayError::ConsumerTooSlow))
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::sequencer::{DbPersistence, IdentityEvent, RepoEvent};

    #[tokio::test]
    async fn test_replay_stops_at_head() {
        let pool = db::open_in_memory().await.unwrap();
        let persister: Arc<dyn EventPersistence> =
            Arc::new(DbPersistence::open(pool).await.unwrap());
        for i in 0..6 {
            persister
                .persist(RepoEvent::Identity(IdentityEvent::new(
                    format!("did:plc:r{}", i),
                    None,
                )))
                .await
                .unwrap();
        }

        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new(
            7,
            rx,
            Arc::new(AtomicBool::new(false)),
            Some(Replay::new(Arc::clone(&persister), 0, 4, 3)),
        );
        sub.prefetch().await.unwrap();

        let mut seqs = Vec::new();
        for _ in 0..4 {
            seqs.push(sub.next().await.unwrap().unwrap().seq);
        }
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert!(sub.is_replaying());

        // Events past the head only arrive through the live channel
        drop(tx);
        assert!(sub.next().await.is_none());
        assert!(!sub.is_replaying());
        assert_eq!(sub.id(), 7);
    }
}
