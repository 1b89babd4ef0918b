/// Upstream subscriptions - one WebSocket per active source
///
/// Each source's event stream is read by its own task. Commit frames become
/// crawl announcements; identity and account frames are verified and
/// sequenced directly. The last upstream sequence consumed is written back
/// to the source registry so a reconnect resumes where it left off.
use crate::{
    crawl::{CrawlDispatcher, CrawlWorker},
    error::{RelayError, RelayResult},
    metrics,
    sequencer::AccountStatus,
    sources::{SourceRegistry, SourceStatus},
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upstream connection settings
#[derive(Debug, Clone)]
pub struct SlurperConfig {
    /// Consecutive failed connections before a source is marked inactive
    pub max_failures: u32,
    /// Frames between cursor writes
    pub cursor_persist_every: u64,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SlurperConfig {
    fn default() -> Self {
        Self {
            max_failures: 15,
            cursor_persist_every: 100,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5 * 60),
        }
    }
}

/// Frame received from a source's subscribeRepos stream
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "$type")]
pub enum UpstreamFrame {
    #[serde(rename = "#commit")]
    Commit(UpstreamCommit),
    #[serde(rename = "#identity")]
    Identity(UpstreamIdentity),
    #[serde(rename = "#account")]
    Account(UpstreamAccount),
    #[serde(rename = "#info")]
    Info(UpstreamInfo),
    #[serde(rename = "#error")]
    Error(UpstreamInfo),
    #[serde(other)]
    Unknown,
}

impl UpstreamFrame {
    fn kind(&self) -> &'static str {
        match self {
            UpstreamFrame::Commit(_) => "commit",
            UpstreamFrame::Identity(_) => "identity",
            UpstreamFrame::Account(_) => "account",
            UpstreamFrame::Info(_) => "info",
            UpstreamFrame::Error(_) => "error",
            UpstreamFrame::Unknown => "unknown",
        }
    }

    /// Upstream sequence number, for frames that carry one
    fn seq(&self) -> Option<i64> {
        match self {
            UpstreamFrame::Commit(c) => Some(c.seq),
            UpstreamFrame::Identity(i) => Some(i.seq),
            UpstreamFrame::Account(a) => Some(a.seq),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamCommit {
    pub seq: i64,
    pub repo: String,
    pub rev: String,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamIdentity {
    pub seq: i64,
    pub did: String,
    #[serde(default)]
    pub handle: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamAccount {
    pub seq: i64,
    pub did: String,
    pub active: bool,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct UpstreamInfo {
    #[serde(alias = "error")]
    pub name: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Reconnect delay after `failures` consecutive failures, with up to 25% jitter
fn reconnect_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exp = base
        .saturating_mul(1u32 << failures.saturating_sub(1).min(16))
        .min(max);
    let jitter_ms = exp.as_millis() as u64 / 4;
    let jitter = if jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=jitter_ms)
    } else {
        0
    };
    exp + Duration::from_millis(jitter)
}

enum StreamEnd {
    Cancelled,
    Disconnected { frames: u64 },
}

struct Connection {
    id: u64,
    cancel: CancellationToken,
}

/// Manages one upstream subscription per source
pub struct Slurper {
    config: SlurperConfig,
    sources: Arc<SourceRegistry>,
    dispatcher: Arc<CrawlDispatcher>,
    worker: Arc<CrawlWorker>,
    connections: Mutex<HashMap<String, Connection>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Slurper {
    pub fn new(
        config: SlurperConfig,
        sources: Arc<SourceRegistry>,
        dispatcher: Arc<CrawlDispatcher>,
        worker: Arc<CrawlWorker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            sources,
            dispatcher,
            worker,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Subscribe to every active source
    pub fn start(self: &Arc<Self>) -> RelayResult<usize> {
        let mut started = 0;
        for source in self.sources.active() {
            if self.subscribe(&source.host)? {
                started += 1;
            }
        }
        info!("Subscribed to {} upstream sources", started);
        Ok(started)
    }

    /// Open a subscription to `host`; false if one is already running
    pub fn subscribe(self: &Arc<Self>, host: &str) -> RelayResult<bool> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::ShuttingDown);
        }

        let mut connections = self.connections.lock();
        if connections.contains_key(host) {
            return Ok(false);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        connections.insert(
            host.to_string(),
            Connection {
                id,
                cancel: cancel.clone(),
            },
        );
        drop(connections);

        let this = Arc::clone(self);
        let host = host.to_string();
        self.tracker
            .spawn(async move { this.run_connection(host, id, cancel).await });
        Ok(true)
    }

    /// Close the subscription to `host`, if any
    pub fn disconnect(&self, host: &str) -> bool {
        match self.connections.lock().remove(host) {
            Some(conn) => {
                conn.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.connections.lock().keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Close every subscription and wait for the readers to persist cursors
    pub async fn shutdown(&self) -> RelayResult<()> {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.connections.lock().clear();
        info!("Upstream subscriptions closed");
        Ok(())
    }

    async fn run_connection(self: Arc<Self>, host: String, id: u64, cancel: CancellationToken) {
        let mut failures: u32 = 0;

        loop {
            let source = match self.sources.get(&host) {
                Some(source) if source.is_active() => source,
                _ => {
                    info!("Source {} is no longer active, dropping subscription", host);
                    break;
                }
            };

            let url = source.subscribe_url(source.cursor);
            debug!("Connecting to {}", url);
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connect_async(url.as_str()) => result,
            };

            match connected {
                Ok((mut socket, _)) => {
                    info!("Connected to upstream {} (cursor {})", host, source.cursor);
                    metrics::UPSTREAM_CONNECTIONS.inc();
                    let end = self.read_stream(&host, &mut socket, source.cursor, &cancel).await;
                    metrics::UPSTREAM_CONNECTIONS.dec();

                    match end {
                        StreamEnd::Cancelled => break,
                        StreamEnd::Disconnected { frames } if frames > 0 => failures = 0,
                        StreamEnd::Disconnected { .. } => failures += 1,
                    }
                    info!("Disconnected from upstream {}", host);
                }
                Err(e) => {
                    failures += 1;
                    warn!("Failed to connect to {} (attempt {}): {}", host, failures, e);
                }
            }

            if failures >= self.config.max_failures {
                error!(
                    "Giving up on {} after {} consecutive failures, marking inactive",
                    host, failures
                );
                if let Err(e) = self.sources.set_status(&host, SourceStatus::Inactive).await {
                    warn!("Failed to mark {} inactive: {}", host, e);
                }
                break;
            }

            let delay = reconnect_delay(self.config.base_backoff, self.config.max_backoff, failures.max(1));
            debug!("Reconnecting to {} in {:?}", host, delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut connections = self.connections.lock();
        if connections.get(&host).map(|c| c.id) == Some(id) {
            connections.remove(&host);
        }
    }

    async fn read_stream(
        &self,
        host: &str,
        socket: &mut UpstreamSocket,
        start_cursor: i64,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        let mut cursor = start_cursor;
        let mut frames = 0u64;
        let mut unsaved = 0u64;

        let end = loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = socket.close(None).await;
                    break StreamEnd::Cancelled;
                }
                msg = socket.next() => msg,
            };

            let payload = match msg {
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = socket.send(Message::Pong(data)).await {
                        warn!("Failed to answer ping from {}: {}", host, e);
                        break StreamEnd::Disconnected { frames };
                    }
                    continue;
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("{} closed the subscription", host);
                    break StreamEnd::Disconnected { frames };
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("Upstream error from {}: {}", host, e);
                    break StreamEnd::Disconnected { frames };
                }
                None => break StreamEnd::Disconnected { frames },
            };

            frames += 1;
            if let Some(seq) = self.handle_payload(host, &payload).await {
                if seq > cursor {
                    cursor = seq;
                    unsaved += 1;
                }
            }
            if unsaved >= self.config.cursor_persist_every {
                self.save_cursor(host, cursor).await;
                unsaved = 0;
            }
        };

        if unsaved > 0 {
            self.save_cursor(host, cursor).await;
        }
        end
    }

    async fn save_cursor(&self, host: &str, cursor: i64) {
        if let Err(e) = self.sources.update_cursor(host, cursor).await {
            warn!("Failed to persist cursor {} for {}: {}", cursor, host, e);
        }
    }

    /// Act on one upstream frame; returns its sequence number when consumed
    async fn handle_payload(&self, host: &str, payload: &[u8]) -> Option<i64> {
        let frame: UpstreamFrame = match serde_json::from_slice(payload) {
            Ok(frame) => frame,
            Err(e) => {
                metrics::record_upstream_frame("malformed");
                debug!("Unparseable frame from {}: {}", host, e);
                return None;
            }
        };
        metrics::record_upstream_frame(frame.kind());
        let seq = frame.seq();

        match frame {
            UpstreamFrame::Commit(commit) => {
                match self.dispatcher.announce(host, &commit.repo, Some(commit.rev)) {
                    Ok(_) => {}
                    Err(RelayError::Backpressure { .. }) => {
                        warn!("Dropped commit announcement for {} from {}: queue full", commit.repo, host);
                    }
                    Err(RelayError::ShuttingDown) => return None,
                    Err(e) => warn!("Rejected announcement for {} from {}: {}", commit.repo, host, e),
                }
            }
            UpstreamFrame::Identity(identity) => {
                if let Err(e) = self
                    .worker
                    .handle_identity(host, &identity.did, identity.handle)
                    .await
                {
                    warn!("Failed to sequence identity event for {}: {}", identity.did, e);
                }
            }
            UpstreamFrame::Account(account) => {
                let status = account.status.as_deref().and_then(AccountStatus::parse);
                if let Err(e) = self
                    .worker
                    .handle_account(host, &account.did, account.active, status)
                    .await
                {
                    warn!("Failed to sequence account event for {}: {}", account.did, e);
                }
            }
            UpstreamFrame::Info(info) => {
                info!("Info from {}: {} {}", host, info.name, info.message.unwrap_or_default());
            }
            UpstreamFrame::Error(err) => {
                warn!("Error from {}: {} {}", host, err.name, err.message.unwrap_or_default());
            }
            UpstreamFrame::Unknown => {}
        }
        seq
    }
}
