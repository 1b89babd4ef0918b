/// Synchronization API endpoints
///
/// Implements the com.atproto.sync.* endpoints a relay serves: hosts asking
/// to be crawled, and the latest revision the relay holds for a repository.
use crate::{
    context::AppContext,
    error::{RelayError, RelayResult},
    rate_limit::rate_limit_middleware,
};
use axum::{
    extract::{Query, State},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

/// Request body for requestCrawl
#[derive(Debug, Deserialize)]
pub struct RequestCrawlInput {
    /// Host of the PDS asking to be crawled
    pub hostname: String,
}

/// Request parameters for getLatestCommit
#[derive(Debug, Deserialize)]
pub struct GetLatestCommitParams {
    /// DID of the repository
    pub did: String,
}

/// Response for getLatestCommit
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestCommitResponse {
    pub cid: String,
    pub rev: String,
}

/// Build sync routes; requestCrawl is rate limited
pub fn routes(ctx: AppContext) -> Router<AppContext> {
    Router::new()
        .route("/xrpc/com.atproto.sync.requestCrawl", post(request_crawl))
        .route_layer(middleware::from_fn_with_state(ctx, rate_limit_middleware))
        .route("/xrpc/com.atproto.sync.getLatestCommit", get(get_latest_commit))
}

/// Register a host and subscribe to its event stream
async fn request_crawl(
    State(ctx): State<AppContext>,
    Json(input): Json<RequestCrawlInput>,
) -> RelayResult<Json<serde_json::Value>> {
    let source = ctx.relay.request_crawl(&input.hostname).await?;
    tracing::info!("Crawl requested for {}", source.host);
    Ok(Json(serde_json::json!({})))
}

/// Latest revision of a repository as seen by the relay
async fn get_latest_commit(
    State(ctx): State<AppContext>,
    Query(params): Query<GetLatestCommitParams>,
) -> RelayResult<Json<LatestCommitResponse>> {
    let head = ctx
        .relay
        .repo_head(&params.did)
        .await?
        .ok_or_else(|| RelayError::NotFound(format!("Repository not found: {}", params.did)))?;

    Ok(Json(LatestCommitResponse {
        cid: head.commit_id,
        rev: head.rev,
    }))
}
