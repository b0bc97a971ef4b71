use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::api::UpstreamApi;
use crate::bus::EventBus;
use crate::detect::{CountChange, count_change};
use crate::error::{Error, Result};
use crate::store::SnapshotStore;
use crate::trackers::poller::PollCycle;
use crate::trackers::{clean_usernames, parse_params};
use crate::types::{EventKind, FollowerSnapshot, TrackerConfig, TrackerEvent, TrackerType, UserProfile};

#[derive(Debug, Deserialize)]
struct FollowerParams {
    #[serde(default)]
    usernames: Vec<String>,
}

/// Watches follower and following counts.
pub struct FollowerCycle {
    api: Arc<dyn UpstreamApi>,
    snapshots: Arc<dyn SnapshotStore<FollowerSnapshot>>,
    bus: EventBus,
}

impl FollowerCycle {
    pub fn new(
        api: Arc<dyn UpstreamApi>,
        snapshots: Arc<dyn SnapshotStore<FollowerSnapshot>>,
        bus: EventBus,
    ) -> Self {
        Self { api, snapshots, bus }
    }

    fn publish(&self, tracker: &TrackerConfig, profile: &UserProfile, kind: EventKind, change: &CountChange) {
        self.bus.publish(TrackerEvent::new(
            &tracker.id,
            TrackerType::Follower,
            kind,
            json!({
                "user_id": profile.id,
                "username": profile.username,
                "previous": change.previous,
                "current": change.current,
                "change": change.change,
                "change_pct": change.change_pct,
            }),
        ));
    }
}

#[async_trait]
impl PollCycle for FollowerCycle {
    fn tracker_type(&self) -> TrackerType {
        TrackerType::Follower
    }

    fn validate(&self, tracker: &TrackerConfig) -> Result<()> {
        let params: FollowerParams = parse_params(tracker)?;
        if clean_usernames(&params.usernames).is_empty() {
            return Err(Error::NoTargets(tracker.id.clone()));
        }
        Ok(())
    }

    async fn run_cycle(&self, tracker: &TrackerConfig) -> Result<()> {
        let params: FollowerParams = parse_params(tracker)?;
        let usernames = clean_usernames(&params.usernames);
        let profiles = self.api.users_by_usernames(&usernames).await?;
        if profiles.len() < usernames.len() {
            warn!(
                "[{}] {} of {} account(s) not found",
                tracker.id,
                usernames.len() - profiles.len(),
                usernames.len()
            );
        }

        for profile in &profiles {
            let previous = self.snapshots.latest(&tracker.id, &profile.id).await?;
            self.snapshots
                .append(FollowerSnapshot {
                    tracker_id: tracker.id.clone(),
                    user_id: profile.id.clone(),
                    username: profile.username.clone(),
                    followers_count: profile.followers_count,
                    following_count: profile.following_count,
                    captured_at: Utc::now(),
                })
                .await?;
            let Some(previous) = previous else {
                debug!("[{}] Baseline captured for @{}", tracker.id, profile.username);
                continue;
            };

            if let Some(change) = count_change(previous.followers_count, profile.followers_count) {
                let kind = if change.increased() {
                    EventKind::FollowersIncreased
                } else {
                    EventKind::FollowersDecreased
                };
                self.publish(tracker, profile, kind, &change);
            }
            if let Some(change) = count_change(previous.following_count, profile.following_count) {
                let kind = if change.increased() {
                    EventKind::FollowingIncreased
                } else {
                    EventKind::FollowingDecreased
                };
                self.publish(tracker, profile, kind, &change);
            }
        }
        Ok(())
    }
}
