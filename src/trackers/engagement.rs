use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::api::UpstreamApi;
use crate::bus::EventBus;
use crate::config::PacerConfig;
use crate::detect::{MIN_ENGAGEMENT_HISTORY, SpikeRule, engagement_spikes};
use crate::error::{Error, Result};
use crate::pacer::Pacer;
use crate::store::SnapshotStore;
use crate::trackers::poller::PollCycle;
use crate::trackers::{clean_usernames, parse_params};
use crate::types::{EngagementSnapshot, EventKind, TrackerConfig, TrackerEvent, TrackerType};

/// Recent posts followed per tracked account.
pub const POSTS_PER_ACCOUNT: usize = 5;

fn default_multiplier() -> f64 {
    3.0
}

fn default_history() -> usize {
    10
}

#[derive(Debug, Deserialize)]
struct EngagementParams {
    #[serde(default)]
    post_ids: Vec<String>,
    #[serde(default)]
    usernames: Vec<String>,
    #[serde(default = "default_multiplier")]
    spike_multiplier: f64,
    /// Absolute per-minute rate.
    #[serde(default)]
    spike_threshold: Option<f64>,
    /// Snapshots per post considered for the historical rate.
    #[serde(default = "default_history")]
    history: usize,
}

impl EngagementParams {
    fn parse(tracker: &TrackerConfig) -> Result<Self> {
        let params: Self = parse_params(tracker)?;
        if !params.spike_multiplier.is_finite() || params.spike_multiplier <= 0.0 {
            return Err(Error::invalid_parameters(&tracker.id, "spike_multiplier must be positive"));
        }
        if params.spike_threshold.is_some_and(|t| !t.is_finite() || t < 0.0) {
            return Err(Error::invalid_parameters(
                &tracker.id,
                "spike_threshold must be a non-negative number",
            ));
        }
        if params.history < MIN_ENGAGEMENT_HISTORY {
            return Err(Error::invalid_parameters(
                &tracker.id,
                format!("history must be at least {MIN_ENGAGEMENT_HISTORY}"),
            ));
        }
        Ok(params)
    }

    fn rule(&self) -> SpikeRule {
        SpikeRule {
            multiplier: self.spike_multiplier,
            threshold: self.spike_threshold,
        }
    }
}

/// Watches like/retweet/reply rates of explicit posts and of the latest posts of accounts.
pub struct EngagementCycle {
    api: Arc<dyn UpstreamApi>,
    snapshots: Arc<dyn SnapshotStore<EngagementSnapshot>>,
    bus: EventBus,
    pacer: Mutex<Pacer>,
}

impl EngagementCycle {
    pub fn new(
        api: Arc<dyn UpstreamApi>,
        snapshots: Arc<dyn SnapshotStore<EngagementSnapshot>>,
        bus: EventBus,
        pacer: PacerConfig,
    ) -> Self {
        Self {
            api,
            snapshots,
            bus,
            pacer: Mutex::new(Pacer::new(pacer)),
        }
    }

    /// Explicit ids first, then each account's latest posts, without duplicates.
    async fn collect_post_ids(&self, tracker: &TrackerConfig, params: &EngagementParams) -> Result<Vec<String>> {
        let mut ids: Vec<String> = Vec::new();
        for id in &params.post_ids {
            push_unique(&mut ids, id);
        }

        let usernames = clean_usernames(&params.usernames);
        if usernames.is_empty() {
            return Ok(ids);
        }
        let accounts = self.api.users_by_usernames(&usernames).await?;
        for account in &accounts {
            let posts = self.api.posts_by_user(&account.id, POSTS_PER_ACCOUNT).await?;
            if posts.is_empty() {
                debug!("[{}] @{} has no recent posts", tracker.id, account.username);
            }
            for post in posts.iter().take(POSTS_PER_ACCOUNT) {
                push_unique(&mut ids, &post.id);
            }
            self.pacer.lock().await.pace().await;
        }
        Ok(ids)
    }
}

fn push_unique(ids: &mut Vec<String>, id: &str) {
    let id = id.trim();
    if !id.is_empty() && !ids.iter().any(|i| i == id) {
        ids.push(id.to_string());
    }
}

#[async_trait]
impl PollCycle for EngagementCycle {
    fn tracker_type(&self) -> TrackerType {
        TrackerType::Engagement
    }

    fn validate(&self, tracker: &TrackerConfig) -> Result<()> {
        let params = EngagementParams::parse(tracker)?;
        let has_posts = params.post_ids.iter().any(|id| !id.trim().is_empty());
        if !has_posts && clean_usernames(&params.usernames).is_empty() {
            return Err(Error::NoTargets(tracker.id.clone()));
        }
        Ok(())
    }

    async fn run_cycle(&self, tracker: &TrackerConfig) -> Result<()> {
        let params = EngagementParams::parse(tracker)?;
        let rule = params.rule();
        let ids = self.collect_post_ids(tracker, &params).await?;
        if ids.is_empty() {
            return Ok(());
        }

        let posts = self.api.posts_by_ids(&ids).await?;
        if posts.len() < ids.len() {
            warn!("[{}] {} of {} post(s) unavailable", tracker.id, ids.len() - posts.len(), ids.len());
        }
        for post in &posts {
            let history = self.snapshots.recent(&tracker.id, &post.id, params.history).await?;
            let now = Utc::now();
            let spikes = engagement_spikes(&history, &post.metrics, now, &rule);
            self.snapshots
                .append(EngagementSnapshot {
                    tracker_id: tracker.id.clone(),
                    post_id: post.id.clone(),
                    metrics: post.metrics,
                    captured_at: now,
                })
                .await?;

            if spikes.is_empty() {
                continue;
            }
            self.bus.publish(TrackerEvent::new(
                &tracker.id,
                TrackerType::Engagement,
                EventKind::EngagementSpike,
                json!({
                    "post_id": post.id,
                    "author_id": post.author_id,
                    "author_username": post.author_username,
                    "metrics": post.metrics,
                    "spikes": spikes,
                }),
            ));
        }
        Ok(())
    }
}
