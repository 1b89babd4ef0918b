/// SQLite-backed repository store
///
/// Keeps every fetched revision body as a snapshot plus a head pointer per
/// repository. Compaction removes snapshots older than the head; staged
/// snapshots ahead of it are kept.
use crate::{
    repo::{
        AppliedRepo, CompactionStats, FetchedRepo, RepoHead, RepoStore, RepoStoreError, StagedHead,
    },
    sequencer::{CommitEvent, RepoEvent},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;
use tracing::{debug, info};

const PLC_PREFIX: &[u8] = b"did:plc:";
const PLC_ID_LEN: usize = 24;

pub struct SqliteRepoStore {
    db: SqlitePool,
}

impl SqliteRepoStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

/// Content address of a revision body
pub fn commit_id(body: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(body)))
}

/// `did:plc` identifiers mentioned in `body`, excluding `own_did`
pub fn extract_references(body: &[u8], own_did: &str) -> Vec<String> {
    let is_id_char = |b: &u8| b.is_ascii_lowercase() || (b'2'..=b'7').contains(b);

    let mut found = BTreeSet::new();
    let mut i = 0;
    while i + PLC_PREFIX.len() + PLC_ID_LEN <= body.len() {
        if &body[i..i + PLC_PREFIX.len()] != PLC_PREFIX {
            i += 1;
            continue;
        }
        let start = i + PLC_PREFIX.len();
        let id = &body[start..start + PLC_ID_LEN];
        let terminated = body
            .get(start + PLC_ID_LEN)
            .map_or(true, |b| !is_id_char(b));
        if id.iter().all(is_id_char) && terminated {
            // all ASCII, checked above
            let did = String::from_utf8_lossy(&body[i..start + PLC_ID_LEN]).into_owned();
            if did != own_did {
                found.insert(did);
            }
            i = start + PLC_ID_LEN;
        } else {
            i += 1;
        }
    }
    found.into_iter().collect()
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, RepoStoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RepoStoreError::Storage(format!("Invalid timestamp: {}", e)))
}

#[async_trait]
impl RepoStore for SqliteRepoStore {
    async fn stage(&self, repo: FetchedRepo) -> Result<AppliedRepo, RepoStoreError> {
        if repo.body.is_empty() {
            return Err(RepoStoreError::Invalid(format!(
                "empty repository body for {}",
                repo.did
            )));
        }
        if repo.rev.is_empty() {
            return Err(RepoStoreError::Invalid(format!(
                "missing revision for {}",
                repo.did
            )));
        }
        if self.is_taken_down(&repo.did).await? {
            debug!("Ignoring fetched revision for taken down repo {}", repo.did);
            return Ok(AppliedRepo::default());
        }

        let previous = self.head(&repo.did).await?.map(|head| head.rev);
        if previous.as_deref().is_some_and(|head| head >= repo.rev.as_str()) {
            debug!(
                "Revision {} of {} is not newer than {:?}, skipping",
                repo.rev, repo.did, previous
            );
            return Ok(AppliedRepo::default());
        }

        // A retried revision reuses its earlier snapshot
        sqlx::query(
            r#"
            INSERT INTO repo_snapshot (did, rev, body, created_at)
            SELECT ?1, ?2, ?3, ?4
            WHERE NOT EXISTS (SELECT 1 FROM repo_snapshot WHERE did = ?1 AND rev = ?2)
            "#,
        )
        .bind(&repo.did)
        .bind(&repo.rev)
        .bind(&repo.body)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;

        let commit = commit_id(&repo.body);
        let references = extract_references(&repo.body, &repo.did);
        let head = StagedHead {
            did: repo.did.clone(),
            rev: repo.rev.clone(),
            commit_id: commit.clone(),
            host: repo.host,
        };
        let event = CommitEvent::new(repo.did, commit, repo.rev, previous, repo.body);

        Ok(AppliedRepo {
            events: vec![RepoEvent::Commit(event)],
            references,
            head: Some(head),
        })
    }

    async fn advance(&self, head: &StagedHead) -> Result<bool, RepoStoreError> {
        // Only move the head forward
        let advanced = sqlx::query(
            r#"
            INSERT INTO repo_head (did, rev, commit_id, host, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(did) DO UPDATE SET
                rev = excluded.rev,
                commit_id = excluded.commit_id,
                host = excluded.host,
                updated_at = excluded.updated_at
            WHERE excluded.rev > repo_head.rev
            "#,
        )
        .bind(&head.did)
        .bind(&head.rev)
        .bind(&head.commit_id)
        .bind(&head.host)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?
        .rows_affected();

        Ok(advanced > 0)
    }

    async fn head(&self, did: &str) -> Result<Option<RepoHead>, RepoStoreError> {
        let row = sqlx::query(
            "SELECT did, rev, commit_id, host, updated_at FROM repo_head WHERE did = ?1",
        )
        .bind(did)
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let updated_at: String = row.try_get("updated_at")?;
        Ok(Some(RepoHead {
            did: row.try_get("did")?,
            rev: row.try_get("rev")?,
            commit_id: row.try_get("commit_id")?,
            host: row.try_get("host")?,
            updated_at: parse_time(&updated_at)?,
        }))
    }

    async fn take_down(&self, did: &str) -> Result<(), RepoStoreError> {
        sqlx::query(
            "INSERT INTO repo_takedown (did, created_at) VALUES (?1, ?2) ON CONFLICT(did) DO NOTHING",
        )
        .bind(did)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn reverse_take_down(&self, did: &str) -> Result<(), RepoStoreError> {
        sqlx::query("DELETE FROM repo_takedown WHERE did = ?1")
            .bind(did)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn is_taken_down(&self, did: &str) -> Result<bool, RepoStoreError> {
        let row = sqlx::query("SELECT 1 FROM repo_takedown WHERE did = ?1")
            .bind(did)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.is_some())
    }

    async fn compact(&self) -> Result<CompactionStats, RepoStoreError> {
        let mut tx = self.db.begin().await?;

        let repos: i64 = sqlx::query(
            r#"
            SELECT COUNT(DISTINCT s.did) AS repos
            FROM repo_snapshot s
            JOIN repo_head h ON h.did = s.did
            WHERE s.rev < h.rev
            "#,
        )
        .fetch_one(&mut *tx)
        .await?
        .try_get("repos")?;

        let removed = sqlx::query(
            r#"
            DELETE FROM repo_snapshot
            WHERE EXISTS (
                SELECT 1 FROM repo_head h
                WHERE h.did = repo_snapshot.did AND h.rev > repo_snapshot.rev
            )
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        if removed > 0 {
            info!(
                "Compacted {} repositories, removed {} superseded snapshots",
                repos, removed
            );
        }

        Ok(CompactionStats {
            repos_compacted: repos as u64,
            snapshots_removed: removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn create_test_store() -> SqliteRepoStore {
        let pool = db::open_in_memory().await.unwrap();
        SqliteRepoStore::new(pool)
    }

    fn fetched(did: &str, rev: &str, body: &[u8]) -> FetchedRepo {
        FetchedRepo {
            did: did.to_string(),
            rev: rev.to_string(),
            host: "pds.example.com".to_string(),
            body: body.to_vec(),
        }
    }

    async fn apply(store: &SqliteRepoStore, repo: FetchedRepo) -> AppliedRepo {
        let applied = store.stage(repo).await.unwrap();
        if let Some(head) = &applied.head {
            store.advance(head).await.unwrap();
        }
        applied
    }

    async fn snapshot_count(store: &SqliteRepoStore, did: &str) -> i64 {
        sqlx::query("SELECT COUNT(*) AS n FROM repo_snapshot WHERE did = ?1")
            .bind(did)
            .fetch_one(&store.db)
            .await
            .unwrap()
            .get("n")
    }

    #[tokio::test]
    async fn test_stage_produces_commit_event() {
        let store = create_test_store().await;
        let applied = store
            .stage(fetched("did:plc:alice", "3kaaa", b"first"))
            .await
            .unwrap();

        assert_eq!(applied.events.len(), 1);
        match &applied.events[0] {
            RepoEvent::Commit(c) => {
                assert_eq!(c.repo, "did:plc:alice");
                assert_eq!(c.rev, "3kaaa");
                assert_eq!(c.since, None);
                assert_eq!(c.commit, commit_id(b"first"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Nothing is published until the head advances
        assert!(store.head("did:plc:alice").await.unwrap().is_none());

        let staged = applied.head.unwrap();
        assert!(store.advance(&staged).await.unwrap());
        let head = store.head("did:plc:alice").await.unwrap().unwrap();
        assert_eq!(head.rev, "3kaaa");
        assert_eq!(head.commit_id, commit_id(b"first"));
    }

    #[tokio::test]
    async fn test_unadvanced_revision_can_be_staged_again() {
        let store = create_test_store().await;
        let first = store
            .stage(fetched("did:plc:alice", "3kaaa", b"first"))
            .await
            .unwrap();
        let retry = store
            .stage(fetched("did:plc:alice", "3kaaa", b"first"))
            .await
            .unwrap();
        assert_eq!(first.events.len(), 1);
        assert_eq!(retry.events.len(), 1);
        assert_eq!(snapshot_count(&store, "did:plc:alice").await, 1);

        let staged = retry.head.unwrap();
        assert!(store.advance(&staged).await.unwrap());
        assert!(!store.advance(&staged).await.unwrap());

        let after = store
            .stage(fetched("did:plc:alice", "3kaaa", b"first"))
            .await
            .unwrap();
        assert!(after.events.is_empty());
        assert!(after.head.is_none());
    }

    #[tokio::test]
    async fn test_older_revision_never_regresses_head() {
        let store = create_test_store().await;
        apply(&store, fetched("did:plc:alice", "3kaab", b"second")).await;
        let applied = apply(&store, fetched("did:plc:alice", "3kaaa", b"first")).await;
        assert!(applied.events.is_empty());
        assert_eq!(store.head("did:plc:alice").await.unwrap().unwrap().rev, "3kaab");

        let again = apply(&store, fetched("did:plc:alice", "3kaab", b"second")).await;
        assert!(again.events.is_empty());

        let stale = StagedHead {
            did: "did:plc:alice".to_string(),
            rev: "3kaaa".to_string(),
            commit_id: commit_id(b"first"),
            host: "pds.example.com".to_string(),
        };
        assert!(!store.advance(&stale).await.unwrap());
        assert_eq!(store.head("did:plc:alice").await.unwrap().unwrap().rev, "3kaab");
    }

    #[tokio::test]
    async fn test_next_revision_carries_previous_as_since() {
        let store = create_test_store().await;
        apply(&store, fetched("did:plc:alice", "3kaaa", b"first")).await;
        let applied = apply(&store, fetched("did:plc:alice", "3kaab", b"second")).await;
        match &applied.events[0] {
            RepoEvent::Commit(c) => assert_eq!(c.since.as_deref(), Some("3kaaa")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_body_is_invalid() {
        let store = create_test_store().await;
        let err = store
            .stage(fetched("did:plc:alice", "3kaaa", b""))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoStoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_taken_down_repo_is_ignored() {
        let store = create_test_store().await;
        store.take_down("did:plc:alice").await.unwrap();
        assert!(store.is_taken_down("did:plc:alice").await.unwrap());

        let applied = apply(&store, fetched("did:plc:alice", "3kaaa", b"data")).await;
        assert!(applied.events.is_empty());

        store.reverse_take_down("did:plc:alice").await.unwrap();
        let applied = apply(&store, fetched("did:plc:alice", "3kaaa", b"data")).await;
        assert_eq!(applied.events.len(), 1);
    }

    #[tokio::test]
    async fn test_compaction_removes_superseded_snapshots() {
        let store = create_test_store().await;
        for rev in ["3kaaa", "3kaab", "3kaac"] {
            apply(&store, fetched("did:plc:alice", rev, rev.as_bytes())).await;
        }
        apply(&store, fetched("did:plc:bob", "3kaaa", b"bob")).await;
        // Staged but not yet published
        store
            .stage(fetched("did:plc:bob", "3kaab", b"bob2"))
            .await
            .unwrap();

        let stats = store.compact().await.unwrap();
        assert_eq!(stats.snapshots_removed, 2);
        assert_eq!(stats.repos_compacted, 1);
        assert_eq!(snapshot_count(&store, "did:plc:bob").await, 2);

        let stats = store.compact().await.unwrap();
        assert_eq!(stats, CompactionStats::default());
    }

    #[test]
    fn test_extract_references() {
        let body = b"follow did:plc:abcdefghijklmnopqrstuvwx and did:plc:abcdefghijklmnopqrstuvwx, \
                     self did:plc:zzzzzzzzzzzzzzzzzzzzzzzz, short did:plc:abc, \
                     other did:plc:234567abcdefghijklmnopqr";
        let refs = extract_references(body, "did:plc:zzzzzzzzzzzzzzzzzzzzzzzz");
        assert_eq!(
            refs,
            vec![
                "did:plc:234567abcdefghijklmnopqr".to_string(),
                "did:plc:abcdefghijklmnopqrstuvwx".to_string(),
            ]
        );
    }
}
