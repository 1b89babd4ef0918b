/// WebSocket firehose for real-time event streaming
///
/// Implements com.atproto.sync.subscribeRepos over the relay's event log.
///
/// # Protocol
///
/// Clients connect via WebSocket and receive JSON frames:
/// - `#commit`: Repository moved to a new revision
/// - `#identity`: Identity document or handle changed
/// - `#account`: Account hosting status changed
/// - `#error`: Terminal error (`OutdatedCursor`, `FutureCursor`,
///   `ConsumerTooSlow`), followed by a close
///
/// With a `cursor`, every retained event after it is replayed before live
/// events, without gaps or repeats. Each frame carries its `seq`.
///
/// # Connection Health
/// - Ping every 30 seconds when otherwise idle
/// - A send that takes longer than 5 seconds disconnects the client
use crate::{
    context::AppContext,
    error::RelayError,
    sequencer::{RepoEvent, SequencedEvent},
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use base64::{engine::general_purpose, Engine as _};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, timeout, Duration, Instant};

const SEND_TIMEOUT_MS: u64 = 5000; // Timeout for sending a message
const PING_INTERVAL_SECS: u64 = 30; // Send ping every 30 seconds

/// Request parameters for subscribeRepos
#[derive(Debug, Deserialize)]
pub struct SubscribeReposParams {
    /// Resume after this sequence number
    pub cursor: Option<i64>,
}

/// Firehose event frame
#[derive(Debug, Serialize)]
#[serde(tag = "$type")]
pub enum FirehoseFrame {
    #[serde(rename = "#commit")]
    Commit(FirehoseCommit),
    #[serde(rename = "#identity")]
    Identity(FirehoseIdentity),
    #[serde(rename = "#account")]
    Account(FirehoseAccount),
    #[serde(rename = "#error")]
    Error(FirehoseError),
}

/// Commit event for firehose
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirehoseCommit {
    pub seq: i64,
    pub rebase: bool,
    pub too_big: bool,
    pub repo: String,
    pub commit: String,
    pub rev: String,
    pub since: Option<String>,
    pub blocks: String, // Base64-encoded repository bytes
    pub ops: Vec<FirehoseOp>,
    pub blobs: Vec<String>,
    pub time: chrono::DateTime<chrono::Utc>,
}

/// Operation in a commit
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirehoseOp {
    pub action: String, // "create", "update", "delete"
    pub path: String,
    pub cid: Option<String>,
}

/// Identity event for firehose
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirehoseIdentity {
    pub seq: i64,
    pub did: String,
    pub time: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// Account event for firehose
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirehoseAccount {
    pub seq: i64,
    pub did: String,
    pub time: chrono::DateTime<chrono::Utc>,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Error message; the stream ends after it
#[derive(Debug, Serialize)]
pub struct FirehoseError {
    pub error: String,
    pub message: Option<String>,
}

impl From<&SequencedEvent> for FirehoseFrame {
    fn from(evt: &SequencedEvent) -> Self {
        match &evt.event {
            RepoEvent::Commit(commit) => FirehoseFrame::Commit(FirehoseCommit {
                seq: evt.seq,
                rebase: false,
                too_big: commit.too_big,
                repo: commit.repo.clone(),
                commit: commit.commit.clone(),
                rev: commit.rev.clone(),
                since: commit.since.clone(),
                blocks: general_purpose::STANDARD.encode(&commit.blocks),
                ops: commit
                    .ops
                    .iter()
                    .map(|op| FirehoseOp {
                        action: op.action.as_str().to_string(),
                        path: op.path.clone(),
                        cid: op.cid.clone(),
                    })
                    .collect(),
                blobs: Vec::new(),
                time: evt.time,
            }),
            RepoEvent::Identity(identity) => FirehoseFrame::Identity(FirehoseIdentity {
                seq: evt.seq,
                did: identity.did.clone(),
                time: evt.time,
                handle: identity.handle.clone(),
            }),
            RepoEvent::Account(account) => FirehoseFrame::Account(FirehoseAccount {
                seq: evt.seq,
                did: account.did.clone(),
                time: evt.time,
                active: account.active,
                status: account.status.map(|s| s.as_str().to_string()),
            }),
        }
    }
}

impl From<&RelayError> for FirehoseFrame {
    fn from(err: &RelayError) -> Self {
        FirehoseFrame::Error(FirehoseError {
            error: err.error_name().to_string(),
            message: Some(err.to_string()),
        })
    }
}

/// WebSocket handler for subscribeRepos
pub async fn subscribe_repos(
    ws: WebSocketUpgrade,
    Query(params): Query<SubscribeReposParams>,
    State(ctx): State<AppContext>,
) -> Response {
    ws.on_upgrade(move |socket| handle_subscription(socket, params, ctx))
}

/// Stream events to one client until it leaves, lags, or the relay stops
async fn handle_subscription(socket: WebSocket, params: SubscribeReposParams, ctx: AppContext) {
    let (mut sender, mut receiver) = socket.split();

    let mut subscription = match ctx.relay.subscribe(params.cursor).await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::debug!("Refusing subscription at cursor {:?}: {}", params.cursor, e);
            let _ = send_error(&mut sender, &e).await;
            return;
        }
    };
    tracing::debug!(
        "Firehose subscriber {} connected (cursor {:?})",
        subscription.id(),
        params.cursor
    );

    let mut ping_interval = interval(Duration::from_secs(PING_INTERVAL_SECS));
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            next = subscription.next() => match next {
                Some(Ok(evt)) => {
                    match send_frame_with_timeout(&mut sender, &FirehoseFrame::from(&evt)).await {
                        Ok(_) => {
                            last_activity = Instant::now();
                        }
                        Err(SendError::Timeout) => {
                            tracing::warn!("Send timeout, disconnecting subscriber {}", subscription.id());
                            let _ = send_error(&mut sender, &RelayError::ConsumerTooSlow).await;
                            break;
                        }
                        Err(SendError::Disconnected) => {
                            tracing::debug!("Client disconnected during send");
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    let _ = send_error(&mut sender, &e).await;
                    break;
                }
                None => {
                    // Relay is shutting down
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },

            // Send periodic pings
            _ = ping_interval.tick() => {
                if last_activity.elapsed() > Duration::from_secs(PING_INTERVAL_SECS)
                    && sender.send(Message::Ping(vec![])).await.is_err()
                {
                    break;
                }
            }

            // Handle client messages
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) => {
                        tracing::debug!("Client closed connection");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        tracing::debug!("Client disconnected");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Error type for sending frames
#[derive(Debug)]
enum SendError {
    Timeout,
    Disconnected,
}

/// Send a frame with timeout
async fn send_frame_with_timeout(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    frame: &FirehoseFrame,
) -> Result<(), SendError> {
    let json = serde_json::to_string(frame).map_err(|_| SendError::Disconnected)?;

    match timeout(
        Duration::from_millis(SEND_TIMEOUT_MS),
        sender.send(Message::Text(json)),
    )
    .await
    {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(SendError::Disconnected),
        Err(_) => Err(SendError::Timeout),
    }
}

/// Send an error frame and close the connection
async fn send_error(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    err: &RelayError,
) -> Result<(), SendError> {
    send_frame_with_timeout(sender, &FirehoseFrame::from(err)).await?;
    sender
        .send(Message::Close(None))
        .await
        .map_err(|_| SendError::Disconnected)
}

/// Build firehose routes
pub fn routes() -> Router<AppContext> {
    Router::new().route("/xrpc/com.atproto.sync.subscribeRepos", get(subscribe_repos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::{AccountEvent, AccountStatus, CommitEvent, CommitOp, OpAction};
    use chrono::Utc;

    #[test]
    fn test_commit_frame_from_event() {
        let mut commit = CommitEvent::new(
            "did:plc:test".to_string(),
            "sha256:abcd".to_string(),
            "3l4example".to_string(),
            Some("3l3example".to_string()),
            vec![1, 2, 3],
        );
        commit.ops.push(CommitOp {
            action: OpAction::Create,
            path: "app.bsky.feed.post/123".to_string(),
            cid: None,
        });
        let evt = SequencedEvent {
            seq: 7,
            time: Utc::now(),
            event: RepoEvent::Commit(commit),
        };

        let json = serde_json::to_value(FirehoseFrame::from(&evt)).unwrap();
        assert_eq!(json["$type"], "#commit");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["repo"], "did:plc:test");
        assert_eq!(json["since"], "3l3example");
        assert_eq!(json["tooBig"], false);
        assert_eq!(json["blocks"], "AQID");
        assert_eq!(json["ops"][0]["action"], "create");
    }

    #[test]
    fn test_account_frame_carries_status() {
        let evt = SequencedEvent {
            seq: 8,
            time: Utc::now(),
            event: RepoEvent::Account(AccountEvent::new(
                "did:plc:test".to_string(),
                false,
                Some(AccountStatus::Takendown),
            )),
        };
        let json = serde_json::to_value(FirehoseFrame::from(&evt)).unwrap();
        assert_eq!(json["$type"], "#account");
        assert_eq!(json["active"], false);
        assert_eq!(json["status"], "takendown");
    }

    #[test]
    fn test_error_frame_names() {
        let json = serde_json::to_value(FirehoseFrame::from(&RelayError::ExpiredCursor {
            cursor: 1,
            oldest: 10,
        }))
        .unwrap();
        assert_eq!(json["$type"], "#error");
        assert_eq!(json["error"], "OutdatedCursor");

        let json = serde_json::to_value(FirehoseFrame::from(&RelayError::ConsumerTooSlow)).unwrap();
        assert_eq!(json["error"], "ConsumerTooSlow");
    }

    #[test]
    fn test_subscribe_repos_params_deserialize() {
        let params: SubscribeReposParams = serde_json::from_str(r#"{"cursor":123}"#).unwrap();
        assert_eq!(params.cursor, Some(123));

        let params: SubscribeReposParams = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(params.cursor, None);
    }
}
