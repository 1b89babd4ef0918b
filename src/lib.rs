//! Aurora Relay - ATProto relay (Big Graph Service)
//!
//! Subscribes to the event streams of many personal data servers, verifies
//! and stores each repository's latest revision, and republishes everything
//! as one totally ordered firehose.

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod crawl;
pub mod db;
pub mod error;
pub mod identity;
pub mod jobs;
pub mod metrics;
pub mod rate_limit;
pub mod relay;
pub mod repo;
pub mod sequencer;
pub mod server;
pub mod sources;

pub use context::AppContext;
pub use error::{RelayError, RelayResult};
pub use relay::Relay;
