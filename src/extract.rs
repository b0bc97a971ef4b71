//! Content extraction: platform-native JSON into the normalized shapes trackers consume.
//!
//! Both the REST client and the real-time feed deliver posts in the same wire shape, so the
//! mapping from platform metric names (`like_count`, `followers_count`, ...) into our own
//! field names lives here and nowhere else.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::feed::FeedItem;
use crate::types::{Post, PostMetrics, TrendItem, UserProfile};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WirePostMetrics {
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub retweet_count: u64,
    #[serde(default)]
    pub reply_count: u64,
    #[serde(default)]
    pub quote_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireTag {
    #[serde(alias = "username")]
    pub tag: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireEntities {
    #[serde(default)]
    pub hashtags: Vec<WireTag>,
    #[serde(default)]
    pub cashtags: Vec<WireTag>,
    #[serde(default)]
    pub mentions: Vec<WireTag>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePost {
    pub id: String,
    #[serde(default)]
    pub text: String,
    pub author_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub public_metrics: Option<WirePostMetrics>,
    pub entities: Option<WireEntities>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireUserMetrics {
    #[serde(default)]
    pub followers_count: u64,
    #[serde(default)]
    pub following_count: u64,
    #[serde(default)]
    pub tweet_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub profile_image_url: Option<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub protected: bool,
    pub public_metrics: Option<WireUserMetrics>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireTrend {
    #[serde(alias = "name")]
    pub trend_name: String,
    #[serde(alias = "tweet_volume")]
    pub tweet_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WireIncludes {
    #[serde(default)]
    users: Vec<WireUser>,
}

pub fn profile_from_wire(user: WireUser) -> UserProfile {
    let metrics = user.public_metrics.unwrap_or_default();
    UserProfile {
        id: user.id,
        username: user.username,
        name: user.name,
        description: user.description,
        location: user.location,
        url: user.url,
        profile_image_url: user.profile_image_url,
        verified: user.verified,
        protected: user.protected,
        followers_count: metrics.followers_count,
        following_count: metrics.following_count,
        post_count: metrics.tweet_count,
    }
}

/// Normalize a wire post. `users` resolves the author's username when expanded.
pub fn post_from_wire(post: WirePost, users: &[WireUser]) -> Post {
    let metrics = post.public_metrics.unwrap_or_default();
    let author_username = post.author_id.as_ref().and_then(|author| {
        users
            .iter()
            .find(|u| &u.id == author)
            .map(|u| u.username.clone())
    });

    let (hashtags, cashtags, mentions) = match post.entities {
        Some(entities) => (
            entities.hashtags.into_iter().map(|t| t.tag).collect(),
            entities
                .cashtags
                .into_iter()
                .map(|t| t.tag.to_uppercase())
                .collect(),
            entities.mentions.into_iter().map(|t| t.tag).collect(),
        ),
        None => scan_entities(&post.text),
    };

    Post {
        id: post.id,
        author_id: post.author_id,
        author_username,
        text: post.text,
        created_at: post.created_at,
        metrics: PostMetrics {
            likes: metrics.like_count,
            retweets: metrics.retweet_count,
            replies: metrics.reply_count,
            quotes: metrics.quote_count,
        },
        hashtags,
        cashtags,
        mentions,
    }
}

pub fn trend_from_wire(trend: WireTrend) -> TrendItem {
    TrendItem {
        name: trend.trend_name,
        count: trend.tweet_count,
    }
}

/// Extract the normalized post carried by a real-time feed item.
pub fn post_from_feed_item(item: &FeedItem) -> Result<Post> {
    let post: WirePost = serde_json::from_value(item.data.clone())?;
    if post.id.is_empty() {
        return Err(Error::transport("feed item without a post id"));
    }
    let includes: WireIncludes = if item.includes.is_null() {
        WireIncludes::default()
    } else {
        serde_json::from_value(item.includes.clone())?
    };
    Ok(post_from_wire(post, &includes.users))
}

/// Fallback entity scan for posts delivered without an `entities` block.
fn scan_entities(text: &str) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut hashtags = Vec::new();
    let mut cashtags = Vec::new();
    let mut mentions = Vec::new();

    for word in text.split_whitespace() {
        let mut chars = word.chars();
        let Some(sigil) = chars.next() else { continue };
        let body: String = chars
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if body.is_empty() {
            continue;
        }
        match sigil {
            '#' => hashtags.push(body),
            // `$5` is a price, not a symbol
            '$' if body.chars().next().is_some_and(|c| c.is_alphabetic()) => {
                cashtags.push(body.to_uppercase())
            }
            '@' => mentions.push(body),
            _ => {}
        }
    }
    (hashtags, cashtags, mentions)
}
