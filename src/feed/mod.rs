//! Real-time feed: rule construction, the transport seam, and the single-connection
//! multiplexer that routes matched items to trackers by rule tag.

pub mod multiplexer;
pub mod rules;
pub mod transport;

use serde::{Deserialize, Serialize};

pub use multiplexer::{ItemHandler, RuleMultiplexer};
pub use transport::{FeedTransport, WsFeedTransport};

/// Rule annotation attached to a delivered item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub tag: String,
}

/// One raw item delivered by the feed. The payload is left as JSON for the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub data: serde_json::Value,
    #[serde(default)]
    pub includes: serde_json::Value,
    #[serde(default)]
    pub matching_rules: Vec<MatchedRule>,
}

impl FeedItem {
    /// Distinct non-empty tags in annotation order.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = Vec::with_capacity(self.matching_rules.len());
        for rule in &self.matching_rules {
            if !rule.tag.is_empty() && !tags.contains(&rule.tag.as_str()) {
                tags.push(&rule.tag);
            }
        }
        tags
    }
}

/// What an open connection reports back to the multiplexer.
#[derive(Debug, Clone)]
pub enum FeedSignal {
    Item(FeedItem),
    /// Non-fatal transport error; the connection stays up.
    Error(String),
    Closed,
}
