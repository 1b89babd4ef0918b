/// Admin API Endpoints
/// Operator actions on sources, domains, repositories and maintenance jobs.
/// Every route requires the admin bearer token.
use crate::{
    auth::AdminAuth,
    context::AppContext,
    crawl::CrawlState,
    error::RelayResult,
    jobs::CompactionRun,
    sources::Source,
};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Build admin API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        // Sources
        .route("/admin/pds/list", get(list_sources))
        .route("/admin/pds/ban", post(ban_source))
        .route("/admin/pds/unban", post(unban_source))
        // Domains
        .route("/admin/domain/list", get(list_domain_bans))
        .route("/admin/domain/ban", post(ban_domain))
        .route("/admin/domain/unban", post(unban_domain))
        // Repositories
        .route("/admin/repo/takedown", post(take_down_repo))
        .route("/admin/repo/reverseTakedown", post(reverse_take_down))
        .route("/admin/repo/crawl", post(crawl_repo))
        .route("/admin/repo/compact", post(compact))
        // Pipeline state
        .route("/admin/crawl/state", get(crawl_state))
        .route("/admin/events/trim", post(trim_events))
}

#[derive(Debug, Deserialize)]
pub struct HostRequest {
    pub host: String,
}

#[derive(Debug, Deserialize)]
pub struct DomainRequest {
    pub domain: String,
}

#[derive(Debug, Deserialize)]
pub struct RepoRequest {
    pub did: String,
}

#[derive(Debug, Deserialize)]
pub struct CrawlRepoRequest {
    pub host: String,
    pub did: String,
    pub rev: Option<String>,
}

/// A source plus whether the relay currently holds its subscription
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceView {
    #[serde(flatten)]
    pub source: Source,
    pub connected: bool,
}

async fn list_sources(
    _auth: AdminAuth,
    State(ctx): State<AppContext>,
) -> Json<serde_json::Value> {
    let connected = ctx.relay.upstream_hosts();
    let sources: Vec<SourceView> = ctx
        .relay
        .sources()
        .list()
        .into_iter()
        .map(|source| SourceView {
            connected: connected.binary_search(&source.host).is_ok(),
            source,
        })
        .collect();

    Json(json!({ "sources": sources }))
}

async fn ban_source(
    _auth: AdminAuth,
    State(ctx): State<AppContext>,
    Json(req): Json<HostRequest>,
) -> RelayResult<Json<Source>> {
    let source = ctx.relay.ban_source(&req.host).await?;
    tracing::warn!("Admin banned source {}", source.host);
    Ok(Json(source))
}

async fn unban_source(
    _auth: AdminAuth,
    State(ctx): State<AppContext>,
    Json(req): Json<HostRequest>,
) -> RelayResult<Json<Source>> {
    let source = ctx.relay.unban_source(&req.host).await?;
    tracing::info!("Admin unbanned source {}", source.host);
    Ok(Json(source))
}

async fn list_domain_bans(_auth: AdminAuth, State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    Json(json!({ "domains": ctx.relay.domain_bans() }))
}

async fn ban_domain(
    _auth: AdminAuth,
    State(ctx): State<AppContext>,
    Json(req): Json<DomainRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    ctx.relay.ban_domain(&req.domain).await?;
    tracing::warn!("Admin banned domain {}", req.domain);
    Ok(Json(json!({ "success": true })))
}

async fn unban_domain(
    _auth: AdminAuth,
    State(ctx): State<AppContext>,
    Json(req): Json<DomainRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    ctx.relay.unban_domain(&req.domain).await?;
    tracing::info!("Admin unbanned domain {}", req.domain);
    Ok(Json(json!({ "success": true })))
}

async fn take_down_repo(
    _auth: AdminAuth,
    State(ctx): State<AppContext>,
    Json(req): Json<RepoRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let evt = ctx.relay.take_down_repo(&req.did).await?;
    Ok(Json(json!({ "did": req.did, "seq": evt.seq })))
}

async fn reverse_take_down(
    _auth: AdminAuth,
    State(ctx): State<AppContext>,
    Json(req): Json<RepoRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let evt = ctx.relay.reverse_take_down(&req.did).await?;
    Ok(Json(json!({ "did": req.did, "seq": evt.seq })))
}

async fn crawl_repo(
    _auth: AdminAuth,
    State(ctx): State<AppContext>,
    Json(req): Json<CrawlRepoRequest>,
) -> RelayResult<Json<serde_json::Value>> {
    let enqueued = ctx.relay.crawl_repo(&req.host, &req.did, req.rev).await?;
    Ok(Json(json!({ "result": enqueued.as_str() })))
}

async fn compact(_auth: AdminAuth, State(ctx): State<AppContext>) -> RelayResult<Json<serde_json::Value>> {
    let body = match ctx.relay.compact().await? {
        CompactionRun::Completed(stats) => json!({
            "status": "completed",
            "reposCompacted": stats.repos_compacted,
            "snapshotsRemoved": stats.snapshots_removed,
        }),
        CompactionRun::AlreadyRunning => json!({ "status": "alreadyRunning" }),
    };
    Ok(Json(body))
}

async fn crawl_state(_auth: AdminAuth, State(ctx): State<AppContext>) -> Json<CrawlState> {
    Json(ctx.relay.crawl_state())
}

async fn trim_events(_auth: AdminAuth, State(ctx): State<AppContext>) -> RelayResult<Json<serde_json::Value>> {
    let body = match ctx.relay.trim_events().await? {
        Some(stats) => json!({
            "eventsRemoved": stats.events_removed,
            "trimmedThrough": stats.trimmed_through,
        }),
        // The database log keeps everything
        None => json!({ "eventsRemoved": 0 }),
    };
    Ok(Json(body))
}
