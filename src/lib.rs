pub mod api;
pub mod bus;
pub mod config;
pub mod detect;
pub mod error;
pub mod extract;
pub mod feed;
pub mod pacer;
pub mod reporter;
pub mod store;
pub mod trackers;
pub mod types;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};

/// Platform REST API base URL (v2).
pub const API_BASE: &str = "https://api.twitter.com/2";

/// Filtered-stream rule management endpoint.
pub const RULES_URL: &str = "https://api.twitter.com/2/tweets/search/stream/rules";

/// Real-time feed WebSocket URL.
/// Matched items arrive as JSON text frames carrying `matching_rules`.
pub const STREAM_WS_URL: &str = "wss://stream.twitter.com/2/tweets/search/stream";
