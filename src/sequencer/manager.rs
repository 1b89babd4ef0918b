/// Event manager - serializes appends and fans events out to subscribers
use crate::{
    error::{RelayError, RelayResult},
    metrics,
    sequencer::{
        persist::{EventPersistence, TrimStats},
        subscription::{Replay, Subscription},
        RepoEvent, SequencedEvent,
    },
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Event manager configuration
#[derive(Debug, Clone)]
pub struct EventManagerConfig {
    /// Per-subscriber channel capacity before the subscriber is dropped
    pub subscriber_buffer: usize,
    /// Events read from persistence per replay page
    pub playback_batch: usize,
}

impl Default for EventManagerConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 1024,
            playback_batch: 500,
        }
    }
}

struct Subscriber {
    tx: mpsc::Sender<SequencedEvent>,
    dropped: Arc<AtomicBool>,
}

/// Single serialization point between ingestion and the firehose
///
/// `add_event` persists and broadcasts under one append lock, so every live
/// subscriber receives events in sequence order, and `subscribe` reads the
/// head under the same lock so replay and live delivery meet without a gap.
pub struct EventManager {
    persister: Arc<dyn EventPersistence>,
    config: EventManagerConfig,
    append_lock: Mutex<()>,
    subscribers: SyncMutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl EventManager {
    pub fn new(persister: Arc<dyn EventPersistence>, config: EventManagerConfig) -> Self {
        Self {
            persister,
            config,
            append_lock: Mutex::new(()),
            subscribers: SyncMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn persister(&self) -> &Arc<dyn EventPersistence> {
        &self.persister
    }

    /// Persist an event and deliver it to every live subscriber
    pub async fn add_event(&self, event: RepoEvent) -> RelayResult<SequencedEvent> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::ShuttingDown);
        }

        let _guard = self.append_lock.lock().await;
        let evt = self.persister.persist(event).await?;
        metrics::record_sequencer_event(evt.event.event_type().as_str(), evt.seq);
        self.broadcast(&evt);

        Ok(evt)
    }

    fn broadcast(&self, evt: &SequencedEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, sub| match sub.tx.try_send(evt.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                sub.dropped.store(true, Ordering::SeqCst);
                metrics::FIREHOSE_SLOW_CONSUMERS_TOTAL.inc();
                warn!(
                    "Dropping firehose subscriber {} at seq {}: buffer of {} events is full",
                    id, evt.seq, self.config.subscriber_buffer
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        metrics::FIREHOSE_SUBSCRIBERS.set(subscribers.len() as i64);
    }

    /// Open a subscription
    ///
    /// Without a cursor the stream is live only. With one, events after the
    /// cursor are replayed up to the head observed at registration, followed
    /// by live events. Fails up front for cursors ahead of the head or older
    /// than retained history.
    pub async fn subscribe(&self, cursor: Option<i64>) -> RelayResult<Subscription> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::ShuttingDown);
        }
        if let Some(c) = cursor {
            if c < 0 {
                return Err(RelayError::Validation(format!("Invalid cursor {}", c)));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer);
        let dropped = Arc::new(AtomicBool::new(false));

        let head = {
            let _guard = self.append_lock.lock().await;
            let head = self.persister.last_seq().await?;
            if let Some(c) = cursor {
                if c > head {
                    return Err(RelayError::FutureCursor { cursor: c, head });
                }
            }

            let mut subscribers = self.subscribers.lock();
            subscribers.insert(
                id,
                Subscriber {
                    tx,
                    dropped: Arc::clone(&dropped),
                },
            );
            metrics::FIREHOSE_SUBSCRIBERS.set(subscribers.len() as i64);
            head
        };

        let replay = cursor.map(|c| {
            Replay::new(
                Arc::clone(&self.persister),
                c,
                head,
                self.config.playback_batch,
            )
        });
        let mut subscription = Subscription::new(id, rx, dropped, replay);

        // Surface an expired cursor before the caller sees any event
        if let Err(e) = subscription.prefetch().await {
            self.unsubscribe(id);
            return Err(e);
        }

        debug!(
            "Firehose subscriber {} registered (cursor {:?}, head {})",
            id, cursor, head
        );
        Ok(subscription)
    }

    fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers.lock();
        subscribers.remove(&id);
        metrics::FIREHOSE_SUBSCRIBERS.set(subscribers.len() as i64);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub async fn last_seq(&self) -> RelayResult<i64> {
        self.persister.last_seq().await
    }

    pub fn retention(&self) -> Option<Duration> {
        self.persister.retention()
    }

    /// Apply the backend's retention window now
    pub async fn trim(&self) -> RelayResult<Option<TrimStats>> {
        let Some(retention) = self.persister.retention() else {
            return Ok(None);
        };
        let window = chrono::Duration::from_std(retention)
            .map_err(|e| RelayError::Internal(format!("Invalid retention window: {}", e)))?;
        self.trim_before(Utc::now() - window).await.map(Some)
    }

    pub async fn trim_before(&self, before: DateTime<Utc>) -> RelayResult<TrimStats> {
        self.persister.trim(before).await
    }

    pub async fn take_down_repo(&self, did: &str) -> RelayResult<()> {
        self.persister.take_down_repo(did).await
    }

    /// End every open subscription and refuse new ones
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut subscribers = self.subscribers.lock();
        let count = subscribers.len();
        subscribers.clear();
        metrics::FIREHOSE_SUBSCRIBERS.set(0);
        if count > 0 {
            info!("Closed {} firehose subscriptions", count);
        }
    }

    /// Close subscribers, wait for the in-flight append, flush the log
    pub async fn shutdown(&self) -> RelayResult<()> {
        self.close_all();
        let _guard = self.append_lock.lock().await;
        self.persister.flush().await?;
        self.persister.shutdown().await
    }
}
