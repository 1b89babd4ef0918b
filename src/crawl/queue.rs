/// Per-source pending crawl queue
use crate::{
    crawl::CrawlTask,
    error::{RelayError, RelayResult},
};
use std::collections::{HashMap, HashSet, VecDeque};

/// How an announcement was absorbed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// New pending task
    Queued,
    /// Merged into the repository's existing pending task
    Coalesced,
}

impl Enqueued {
    pub fn as_str(&self) -> &'static str {
        match self {
            Enqueued::Queued => "queued",
            Enqueued::Coalesced => "coalesced",
        }
    }
}

/// Bounded FIFO of pending tasks, at most one per repository
///
/// A repository that is already being crawled stays queued until its running
/// task completes, so one repository never has two tasks in flight.
#[derive(Debug)]
pub struct SourceQueue {
    host: String,
    capacity: usize,
    pending: HashMap<String, CrawlTask>,
    order: VecDeque<String>,
    in_flight: HashSet<String>,
}

impl SourceQueue {
    pub fn new(host: impl Into<String>, capacity: usize) -> Self {
        Self {
            host: host.into(),
            capacity,
            pending: HashMap::new(),
            order: VecDeque::new(),
            in_flight: HashSet::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Add a task, merging with a pending task for the same repository
    ///
    /// The merged task keeps the newest revision; an unspecified revision
    /// ("latest") wins over any specific one. Fails with `Backpressure`
    /// when a new repository would exceed capacity.
    pub fn push(&mut self, task: CrawlTask) -> RelayResult<Enqueued> {
        if let Some(existing) = self.pending.get_mut(&task.did) {
            existing.rev = match (existing.rev.take(), task.rev) {
                (Some(current), Some(announced)) => Some(current.max(announced)),
                _ => None,
            };
            existing.attempts = 0;
            return Ok(Enqueued::Coalesced);
        }

        if self.pending.len() >= self.capacity {
            return Err(RelayError::Backpressure {
                host: self.host.clone(),
                capacity: self.capacity,
            });
        }

        self.order.push_back(task.did.clone());
        self.pending.insert(task.did.clone(), task);
        Ok(Enqueued::Queued)
    }

    /// Oldest task whose repository is not in flight; marks it in flight
    pub fn take(&mut self) -> Option<CrawlTask> {
        let idx = self
            .order
            .iter()
            .position(|did| !self.in_flight.contains(did))?;
        let did = self.order.remove(idx)?;
        let task = self.pending.remove(&did)?;
        self.in_flight.insert(did);
        Some(task)
    }

    /// Release a repository after its task finished
    pub fn complete(&mut self, did: &str) {
        self.in_flight.remove(did);
    }

    /// Put a failed task back for another attempt
    ///
    /// Returns false when the retry was dropped: a newer announcement for
    /// the repository is already pending, or the queue is full.
    pub fn requeue(&mut self, task: CrawlTask) -> bool {
        if self.pending.contains_key(&task.did) || self.pending.len() >= self.capacity {
            return false;
        }
        self.order.push_back(task.did.clone());
        self.pending.insert(task.did.clone(), task);
        true
    }

    /// Remove every pending task
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.order.clear();
        dropped
    }

    pub fn depth(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(did: &str, rev: Option<&str>) -> CrawlTask {
        CrawlTask::new("pds.example.com", did, rev.map(str::to_string))
    }

    #[test]
    fn test_overflow_fails_fast() {
        let mut queue = SourceQueue::new("pds.example.com", 2);
        assert_eq!(queue.push(task("did:plc:a", Some("1"))).unwrap(), Enqueued::Queued);
        assert_eq!(queue.push(task("did:plc:b", Some("1"))).unwrap(), Enqueued::Queued);

        let err = queue.push(task("did:plc:c", Some("1"))).unwrap_err();
        assert!(matches!(err, RelayError::Backpressure { capacity: 2, .. }));
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn test_coalescing_keeps_latest_revision() {
        let mut queue = SourceQueue::new("pds.example.com", 1);
        queue.push(task("did:plc:a", Some("3kaaa"))).unwrap();
        assert_eq!(
            queue.push(task("did:plc:a", Some("3kaac"))).unwrap(),
            Enqueued::Coalesced
        );
        // An older announcement arriving late does not regress the task
        queue.push(task("did:plc:a", Some("3kaab"))).unwrap();
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.take().unwrap().rev.as_deref(), Some("3kaac"));

        queue.push(task("did:plc:b", Some("3kaaa"))).unwrap();
        queue.push(task("did:plc:b", None)).unwrap();
        queue.push(task("did:plc:b", Some("3kaaz"))).unwrap();
        assert_eq!(queue.take().unwrap().rev, None);
    }

    #[test]
    fn test_in_flight_repository_is_skipped() {
        let mut queue = SourceQueue::new("pds.example.com", 10);
        queue.push(task("did:plc:a", Some("1"))).unwrap();
        let first = queue.take().unwrap();
        assert_eq!(queue.in_flight(), 1);

        queue.push(task("did:plc:a", Some("2"))).unwrap();
        queue.push(task("did:plc:b", Some("1"))).unwrap();

        // did:plc:a is still running, so b goes first
        assert_eq!(queue.take().unwrap().did, "did:plc:b");
        assert!(queue.take().is_none());

        queue.complete(&first.did);
        let next = queue.take().unwrap();
        assert_eq!(next.did, "did:plc:a");
        assert_eq!(next.rev.as_deref(), Some("2"));
    }

    #[test]
    fn test_requeue_superseded_by_newer_announcement() {
        let mut queue = SourceQueue::new("pds.example.com", 10);
        queue.push(task("did:plc:a", Some("1"))).unwrap();
        let mut failed = queue.take().unwrap();
        queue.complete(&failed.did);
        failed.attempts = 1;

        queue.push(task("did:plc:a", Some("2"))).unwrap();
        assert!(!queue.requeue(failed.clone()));

        let newer = queue.take().unwrap();
        assert_eq!(newer.rev.as_deref(), Some("2"));
        queue.complete(&newer.did);
        assert!(queue.requeue(failed));
        assert_eq!(queue.take().unwrap().attempts, 1);
    }
}
