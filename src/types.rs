use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Trackers ───────────────────────────────────────────────────────

/// The eight detection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerType {
    User,
    Hashtag,
    Keyword,
    Cashtag,
    Profile,
    Follower,
    Trend,
    Engagement,
}

impl TrackerType {
    pub const ALL: [TrackerType; 8] = [
        TrackerType::User,
        TrackerType::Hashtag,
        TrackerType::Keyword,
        TrackerType::Cashtag,
        TrackerType::Profile,
        TrackerType::Follower,
        TrackerType::Trend,
        TrackerType::Engagement,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TrackerType::User => "user",
            TrackerType::Hashtag => "hashtag",
            TrackerType::Keyword => "keyword",
            TrackerType::Cashtag => "cashtag",
            TrackerType::Profile => "profile",
            TrackerType::Follower => "follower",
            TrackerType::Trend => "trend",
            TrackerType::Engagement => "engagement",
        }
    }

    /// Stream-based strategies own matching rules; the rest poll.
    pub fn is_stream(self) -> bool {
        matches!(
            self,
            TrackerType::User | TrackerType::Hashtag | TrackerType::Keyword | TrackerType::Cashtag
        )
    }
}

impl fmt::Display for TrackerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrackerType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown tracker type: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrackerStatus {
    Active,
    Paused,
    Error,
}

/// Persisted record for one configured tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub tracker_type: TrackerType,
    pub status: TrackerStatus,
    /// Strategy-specific parameters, parsed by the owning strategy.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Upstream rule ids; only populated for stream-based trackers.
    #[serde(default)]
    pub rule_ids: BTreeSet<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TrackerConfig {
    /// New tracker with a generated id, created paused.
    pub fn new(
        name: impl Into<String>,
        tracker_type: TrackerType,
        parameters: serde_json::Value,
    ) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), name, tracker_type, parameters)
    }

    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        tracker_type: TrackerType,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tracker_type,
            status: TrackerStatus::Paused,
            parameters,
            rule_ids: BTreeSet::new(),
            last_run_at: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

// ── Feed rules ─────────────────────────────────────────────────────

/// A rule as registered with the upstream feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingRule {
    pub id: String,
    pub value: String,
    #[serde(default)]
    pub tag: String,
}

/// A rule awaiting registration; the feed assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRule {
    pub value: String,
    pub tag: String,
}

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewTweet,
    VelocitySpike,
    ProfileChange,
    FollowersIncreased,
    FollowersDecreased,
    FollowingIncreased,
    FollowingDecreased,
    NewTrend,
    DisappearedTrend,
    RisingTrend,
    EngagementSpike,
}

/// Normalized detection delivered through the event bus. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerEvent {
    pub tracker_id: String,
    pub tracker_type: TrackerType,
    pub event_type: EventKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TrackerEvent {
    pub fn new(
        tracker_id: impl Into<String>,
        tracker_type: TrackerType,
        event_type: EventKind,
        data: serde_json::Value,
    ) -> Self {
        Self {
            tracker_id: tracker_id.into(),
            tracker_type,
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }
}

// ── Platform content ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMetrics {
    pub likes: u64,
    pub retweets: u64,
    pub replies: u64,
    pub quotes: u64,
}

/// Normalized post produced by the content extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub author_id: Option<String>,
    pub author_username: Option<String>,
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
    pub metrics: PostMetrics,
    #[serde(default)]
    pub hashtags: Vec<String>,
    #[serde(default)]
    pub cashtags: Vec<String>,
    #[serde(default)]
    pub mentions: Vec<String>,
}

/// De-duplicated post record shared by every tracker whose rules matched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedPost {
    pub post: Post,
    pub matched_tracker_ids: Vec<String>,
    pub matched_rule_tags: Vec<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl TrackedPost {
    pub fn new(post: Post, tracker_id: &str, tag: &str) -> Self {
        let now = Utc::now();
        Self {
            post,
            matched_tracker_ids: vec![tracker_id.to_string()],
            matched_rule_tags: vec![tag.to_string()],
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    /// Append a tracker/tag pair to the match lists. Returns `false` if both were present.
    pub fn record_match(&mut self, tracker_id: &str, tag: &str) -> bool {
        let mut changed = false;
        if !self.matched_tracker_ids.iter().any(|t| t == tracker_id) {
            self.matched_tracker_ids.push(tracker_id.to_string());
            changed = true;
        }
        if !self.matched_rule_tags.iter().any(|t| t == tag) {
            self.matched_rule_tags.push(tag.to_string());
            changed = true;
        }
        self.last_seen_at = Utc::now();
        changed
    }
}

/// Profile fields compared by the profile tracker when none are configured.
pub const DEFAULT_PROFILE_FIELDS: &[&str] = &[
    "name",
    "description",
    "location",
    "url",
    "profile_image_url",
    "verified",
    "protected",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub profile_image_url: Option<String>,
    pub verified: bool,
    pub protected: bool,
    pub followers_count: u64,
    pub following_count: u64,
    pub post_count: u64,
}

impl UserProfile {
    /// String representation of a comparable field, `None` for unknown field names.
    pub fn field_value(&self, field: &str) -> Option<String> {
        let text = |v: &Option<String>| v.clone().unwrap_or_default();
        let value = match field {
            "username" => self.username.clone(),
            "name" => self.name.clone(),
            "description" => text(&self.description),
            "location" => text(&self.location),
            "url" => text(&self.url),
            "profile_image_url" => text(&self.profile_image_url),
            "verified" => self.verified.to_string(),
            "protected" => self.protected.to_string(),
            "followers_count" => self.followers_count.to_string(),
            "following_count" => self.following_count.to_string(),
            "post_count" => self.post_count.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendItem {
    pub name: String,
    /// Post volume; the platform omits it for low-volume trends.
    pub count: Option<u64>,
}

// ── Snapshots ──────────────────────────────────────────────────────

/// Immutable point-in-time capture of one subject, owned by the tracker that took it.
pub trait Snapshot: Clone + Send + Sync + 'static {
    fn tracker_id(&self) -> &str;
    fn subject_id(&self) -> &str;
    fn captured_at(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub tracker_id: String,
    pub user_id: String,
    pub username: String,
    pub fields: BTreeMap<String, String>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowerSnapshot {
    pub tracker_id: String,
    pub user_id: String,
    pub username: String,
    pub followers_count: u64,
    pub following_count: u64,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSnapshot {
    pub tracker_id: String,
    /// `woeid:<n>`
    pub region_id: String,
    pub trends: Vec<TrendItem>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementSnapshot {
    pub tracker_id: String,
    pub post_id: String,
    pub metrics: PostMetrics,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot for ProfileSnapshot {
    fn tracker_id(&self) -> &str {
        &self.tracker_id
    }
    fn subject_id(&self) -> &str {
        &self.user_id
    }
    fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

impl Snapshot for FollowerSnapshot {
    fn tracker_id(&self) -> &str {
        &self.tracker_id
    }
    fn subject_id(&self) -> &str {
        &self.user_id
    }
    fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

impl Snapshot for TrendSnapshot {
    fn tracker_id(&self) -> &str {
        &self.tracker_id
    }
    fn subject_id(&self) -> &str {
        &self.region_id
    }
    fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

impl Snapshot for EngagementSnapshot {
    fn tracker_id(&self) -> &str {
        &self.tracker_id
    }
    fn subject_id(&self) -> &str {
        &self.post_id
    }
    fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

/// One changed profile field, written to the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileChange {
    pub tracker_id: String,
    pub user_id: String,
    pub username: String,
    pub field: String,
    pub old_value: String,
    pub new_value: String,
    pub detected_at: DateTime<Utc>,
}
