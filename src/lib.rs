//! Auto-responder for messaging-platform webhooks.
//!
//! Direct messages are batched per conversation and answered once the
//! conversation goes quiet; comments get a single delayed reply. Every
//! verified delivery is kept in a bounded event log that live observers can
//! replay and tail over server-sent events.

pub mod batcher;
pub mod broadcaster;
pub mod config;
pub mod event_log;
pub mod http_server;
pub mod ingest;
pub mod parse;
pub mod pipeline;
pub mod providers;
pub mod scheduler;
pub mod sentiment;
pub mod types;
pub mod verification;

#[cfg(test)]
mod testing;

pub use broadcaster::Broadcaster;
pub use config::Config;
pub use http_server::{router, AppState};
