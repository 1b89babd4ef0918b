/// API routes and handlers
pub mod admin;
pub mod firehose;
pub mod health;
pub mod sync;

use crate::context::AppContext;
use axum::Router;

/// Build API routes
pub fn routes(ctx: AppContext) -> Router<AppContext> {
    Router::new()
        .merge(health::routes())
        .merge(sync::routes(ctx))
        .merge(firehose::routes())
        .merge(admin::routes())
}
