/// Table-backed event log
use crate::{
    error::{RelayError, RelayResult},
    sequencer::{
        persist::{EventPersistence, PlaybackPage, TrimStats},
        EventType, RepoEvent, SequencedEvent,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{Row, SqlitePool};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

const TRIMMED_THROUGH_KEY: &str = "trimmed_through";

/// Event log stored as rows in `repo_seq`
///
/// Sequence numbers are assigned explicitly under an append lock rather than
/// by the table's rowid, so a failed insert never leaves a gap.
pub struct DbPersistence {
    db: SqlitePool,
    append_lock: Mutex<()>,
    last_seq: AtomicI64,
    trimmed_through: AtomicI64,
}

impl DbPersistence {
    /// Open the log, recovering the head and trim watermark
    pub async fn open(db: SqlitePool) -> RelayResult<Self> {
        let trimmed_through: i64 = sqlx::query("SELECT value FROM seq_meta WHERE key = ?1")
            .bind(TRIMMED_THROUGH_KEY)
            .fetch_optional(&db)
            .await?
            .map(|row| row.try_get::<i64, _>("value"))
            .transpose()?
            .unwrap_or(0);

        let max_seq: Option<i64> = sqlx::query("SELECT MAX(seq) AS max_seq FROM repo_seq")
            .fetch_one(&db)
            .await?
            .try_get("max_seq")?;

        let last_seq = max_seq.unwrap_or(0).max(trimmed_through);
        info!(
            "Opened database event log at seq {} (trimmed through {})",
            last_seq, trimmed_through
        );

        Ok(Self {
            db,
            append_lock: Mutex::new(()),
            last_seq: AtomicI64::new(last_seq),
            trimmed_through: AtomicI64::new(trimmed_through),
        })
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> RelayResult<(SequencedEvent, bool)> {
        let event_type: String = row.try_get("event_type")?;
        let event_type: EventType = event_type.parse()?;
        let payload: Vec<u8> = row.try_get("event")?;
        let time_str: String = row.try_get("sequenced_at")?;
        let time = DateTime::parse_from_rfc3339(&time_str)
            .map_err(|e| RelayError::Internal(format!("Invalid timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok((
            SequencedEvent {
                seq: row.try_get("seq")?,
                time,
                event: RepoEvent::decode(event_type, &payload)?,
            },
            row.try_get::<i64, _>("invalidated")? != 0,
        ))
    }
}

fn timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl EventPersistence for DbPersistence {
    async fn persist(&self, event: RepoEvent) -> RelayResult<SequencedEvent> {
        let payload = event.encode()?;
        let _guard = self.append_lock.lock().await;

        let seq = self.last_seq.load(Ordering::SeqCst) + 1;
        let time = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO repo_seq (seq, did, event_type, event, invalidated, sequenced_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5)
            "#,
        )
        .bind(seq)
        .bind(event.did())
        .bind(event.event_type().as_str())
        .bind(&payload)
        .bind(timestamp(&time))
        .execute(&self.db)
        .await?;

        self.last_seq.store(seq, Ordering::SeqCst);
        Ok(SequencedEvent { seq, time, event })
    }

    async fn playback(&self, since: i64, limit: usize) -> RelayResult<PlaybackPage> {
        let trimmed = self.trimmed_through.load(Ordering::SeqCst);
        if since < trimmed {
            return Err(RelayError::ExpiredCursor {
                cursor: since,
                oldest: trimmed + 1,
            });
        }

        let rows = sqlx::query(
            r#"
            SELECT seq, did, event_type, event, invalidated, sequenced_at
            FROM repo_seq
            WHERE seq > ?1
            ORDER BY seq ASC
            LIMIT ?2
            "#,
        )
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;

        let mut page = PlaybackPage {
            events: Vec::with_capacity(rows.len()),
            next_cursor: since,
        };
        for row in &rows {
            let (evt, invalidated) = Self::row_to_event(row)?;
            page.next_cursor = evt.seq;
            if !invalidated {
                page.events.push(evt);
            }
        }

        // A trim may have raced with the read
        if since < self.trimmed_through.load(Ordering::SeqCst) {
            return Err(RelayError::ExpiredCursor {
                cursor: since,
                oldest: self.trimmed_through.load(Ordering::SeqCst) + 1,
            });
        }

        Ok(page)
    }

    async fn last_seq(&self) -> RelayResult<i64> {
        Ok(self.last_seq.load(Ordering::SeqCst))
    }

    async fn trim(&self, before: DateTime<Utc>) -> RelayResult<TrimStats> {
        let cutoff: Option<i64> = sqlx::query(
            "SELECT MAX(seq) AS max_seq FROM repo_seq WHERE sequenced_at < ?1",
        )
        .bind(timestamp(&before))
        .fetch_one(&self.db)
        .await?
        .try_get("max_seq")?;

        let Some(cutoff) = cutoff else {
            return Ok(TrimStats {
                events_removed: 0,
                trimmed_through: self.trimmed_through.load(Ordering::SeqCst),
            });
        };

        // Raise the watermark first so readers never see a partial range
        self.trimmed_through.fetch_max(cutoff, Ordering::SeqCst);

        let mut tx = self.db.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO seq_meta (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)
            "#,
        )
        .bind(TRIMMED_THROUGH_KEY)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query("DELETE FROM repo_seq WHERE seq <= ?1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(TrimStats {
            events_removed: removed,
            trimmed_through: cutoff,
        })
    }

    async fn take_down_repo(&self, did: &str) -> RelayResult<()> {
        sqlx::query("UPDATE repo_seq SET invalidated = 1 WHERE did = ?1")
            .bind(did)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    fn retention(&self) -> Option<Duration> {
        None
    }

    async fn flush(&self) -> RelayResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> RelayResult<()> {
        let _guard = self.append_lock.lock().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::sequencer::{CommitEvent, IdentityEvent};

    async fn create_test_log() -> (SqlitePool, DbPersistence) {
        let pool = db::open_in_memory().await.unwrap();
        let log = DbPersistence::open(pool.clone()).await.unwrap();
        (pool, log)
    }

    fn commit(did: &str, rev: &str) -> RepoEvent {
        RepoEvent::Commit(CommitEvent::new(
            did.to_string(),
            format!("sha256:{}", rev),
            rev.to_string(),
            None,
            vec![],
        ))
    }

    #[tokio::test]
    async fn test_persist_assigns_consecutive_seqs() {
        let (_pool, log) = create_test_log().await;
        assert_eq!(log.last_seq().await.unwrap(), 0);

        for expected in 1..=3 {
            let evt = log.persist(commit("did:plc:test", "3kaaa")).await.unwrap();
            assert_eq!(evt.seq, expected);
        }
        assert_eq!(log.last_seq().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_playback_pages() {
        let (_pool, log) = create_test_log().await;
        for i in 1..=5 {
            log.persist(commit(&format!("did:plc:test{}", i), "3kaaa"))
                .await
                .unwrap();
        }

        let page = log.playback(2, 2).await.unwrap();
        let seqs: Vec<i64> = page.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
        assert_eq!(page.next_cursor, 4);

        let page = log.playback(5, 10).await.unwrap();
        assert!(page.events.is_empty());
        assert_eq!(page.next_cursor, 5);
    }

    #[tokio::test]
    async fn test_takedown_skips_events_but_advances_cursor() {
        let (_pool, log) = create_test_log().await;
        log.persist(commit("did:plc:bad", "3kaaa")).await.unwrap();
        log.persist(commit("did:plc:bad", "3kaab")).await.unwrap();
        log.persist(RepoEvent::Identity(IdentityEvent::new(
            "did:plc:good".to_string(),
            None,
        )))
        .await
        .unwrap();
        log.take_down_repo("did:plc:bad").await.unwrap();

        let page = log.playback(0, 2).await.unwrap();
        assert!(page.events.is_empty());
        assert_eq!(page.next_cursor, 2);

        let page = log.playback(page.next_cursor, 2).await.unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].event.did(), "did:plc:good");
    }

    #[tokio::test]
    async fn test_trim_expires_old_cursors_and_keeps_numbering() {
        let (pool, log) = create_test_log().await;
        for _ in 0..3 {
            log.persist(commit("did:plc:test", "3kaaa")).await.unwrap();
        }

        let stats = log
            .trim(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stats.events_removed, 3);
        assert_eq!(stats.trimmed_through, 3);

        let err = log.playback(1, 10).await.unwrap_err();
        assert!(matches!(err, RelayError::ExpiredCursor { cursor: 1, oldest: 4 }));
        assert!(log.playback(3, 10).await.unwrap().events.is_empty());

        // Reopening with an empty table must not reuse numbers
        let reopened = DbPersistence::open(pool).await.unwrap();
        let evt = reopened.persist(commit("did:plc:test", "3kaab")).await.unwrap();
        assert_eq!(evt.seq, 4);
    }
}
