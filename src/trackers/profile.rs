use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::api::UpstreamApi;
use crate::bus::EventBus;
use crate::detect::diff_fields;
use crate::error::{Error, Result};
use crate::store::{ChangeLogStore, SnapshotStore};
use crate::trackers::poller::PollCycle;
use crate::trackers::{clean_usernames, parse_params};
use crate::types::{
    DEFAULT_PROFILE_FIELDS, EventKind, ProfileChange, ProfileSnapshot, TrackerConfig, TrackerEvent,
    TrackerType, UserProfile,
};

#[derive(Debug, Deserialize)]
struct ProfileParams {
    #[serde(default)]
    usernames: Vec<String>,
    #[serde(default)]
    fields: Option<Vec<String>>,
}

impl ProfileParams {
    fn fields(&self) -> Vec<String> {
        match &self.fields {
            Some(fields) if !fields.is_empty() => fields.iter().map(|f| f.trim().to_string()).collect(),
            _ => DEFAULT_PROFILE_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// Watches profile fields of a set of accounts and logs every change.
pub struct ProfileCycle {
    api: Arc<dyn UpstreamApi>,
    snapshots: Arc<dyn SnapshotStore<ProfileSnapshot>>,
    changes: Arc<dyn ChangeLogStore>,
    bus: EventBus,
}

impl ProfileCycle {
    pub fn new(
        api: Arc<dyn UpstreamApi>,
        snapshots: Arc<dyn SnapshotStore<ProfileSnapshot>>,
        changes: Arc<dyn ChangeLogStore>,
        bus: EventBus,
    ) -> Self {
        Self {
            api,
            snapshots,
            changes,
            bus,
        }
    }

    async fn check(&self, tracker: &TrackerConfig, profile: &UserProfile, fields: &[String]) -> Result<()> {
        let values: BTreeMap<String, String> = fields
            .iter()
            .filter_map(|f| profile.field_value(f).map(|v| (f.clone(), v)))
            .collect();
        let previous = self.snapshots.latest(&tracker.id, &profile.id).await?;
        let now = Utc::now();
        self.snapshots
            .append(ProfileSnapshot {
                tracker_id: tracker.id.clone(),
                user_id: profile.id.clone(),
                username: profile.username.clone(),
                fields: values.clone(),
                captured_at: now,
            })
            .await?;

        let Some(previous) = previous else {
            debug!("[{}] Baseline captured for @{}", tracker.id, profile.username);
            return Ok(());
        };
        for change in diff_fields(&previous.fields, &values) {
            self.changes
                .append(ProfileChange {
                    tracker_id: tracker.id.clone(),
                    user_id: profile.id.clone(),
                    username: profile.username.clone(),
                    field: change.field.clone(),
                    old_value: change.old_value.clone(),
                    new_value: change.new_value.clone(),
                    detected_at: now,
                })
                .await?;
            self.bus.publish(TrackerEvent::new(
                &tracker.id,
                TrackerType::Profile,
                EventKind::ProfileChange,
                json!({
                    "user_id": profile.id,
                    "username": profile.username,
                    "field": change.field,
                    "old_value": change.old_value,
                    "new_value": change.new_value,
                }),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PollCycle for ProfileCycle {
    fn tracker_type(&self) -> TrackerType {
        TrackerType::Profile
    }

    fn validate(&self, tracker: &TrackerConfig) -> Result<()> {
        let params: ProfileParams = parse_params(tracker)?;
        if clean_usernames(&params.usernames).is_empty() {
            return Err(Error::NoTargets(tracker.id.clone()));
        }
        let blank = UserProfile::default();
        if let Some(unknown) = params.fields().iter().find(|f| blank.field_value(f).is_none()) {
            return Err(Error::invalid_parameters(
                &tracker.id,
                format!("unknown profile field {unknown:?}"),
            ));
        }
        Ok(())
    }

    async fn run_cycle(&self, tracker: &TrackerConfig) -> Result<()> {
        let params: ProfileParams = parse_params(tracker)?;
        let usernames = clean_usernames(&params.usernames);
        let fields = params.fields();

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
            self.check(tracker, profile, &fields).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventFilter;
    use crate::store::{MemoryChangeLog, MemorySnapshotStore};
    use crate::testing::{FakeApi, profile};

    struct Fixture {
        api: Arc<FakeApi>,
        changes: Arc<MemoryChangeLog>,
        bus: EventBus,
        cycle: ProfileCycle,
    }

    fn fixture() -> Fixture {
        let api = Arc::new(FakeApi::default());
        let changes = Arc::new(MemoryChangeLog::new());
        let bus = EventBus::new(64);
        let cycle = ProfileCycle::new(
            api.clone(),
            Arc::new(MemorySnapshotStore::<ProfileSnapshot>::new()),
            changes.clone(),
            bus.clone(),
        );
        Fixture {
            api,
            changes,
            bus,
            cycle,
        }
    }

    fn tracker(params: serde_json::Value) -> TrackerConfig {
        TrackerConfig::with_id("t1", "profiles", TrackerType::Profile, params)
    }

    #[tokio::test]
    async fn first_cycle_is_baseline_then_changes_are_logged() {
        let f = fixture();
        let mut events = f.bus.subscribe(EventFilter::All);
        let config = tracker(json!({"usernames": ["jack"]}));

        f.api.set_users(vec![profile("42", "jack")]);
        f.cycle.run_cycle(&config).await.unwrap();
        assert!(events.try_recv().is_none());

        let mut renamed = profile("42", "jack");
        renamed.name = "Jack D".into();
        renamed.location = Some("SF".into());
        f.api.set_users(vec![renamed]);
        f.cycle.run_cycle(&config).await.unwrap();

        let mut fields = Vec::new();
        while let Some(event) = events.try_recv() {
            assert_eq!(event.event_type, EventKind::ProfileChange);
            fields.push(event.data["field"].as_str().unwrap().to_string());
        }
        fields.sort();
        assert_eq!(fields, vec!["location", "name"]);

        let log = f.changes.for_user("42").await.unwrap();
        assert_eq!(log.len(), 2);
        let name = log.iter().find(|c| c.field == "name").unwrap();
        assert_eq!(name.old_value, "jack");
        assert_eq!(name.new_value, "Jack D");
    }

    #[tokio::test]
    async fn only_configured_fields_are_compared() {
        let f = fixture();
        let mut events = f.bus.subscribe(EventFilter::All);
        let config = tracker(json!({"usernames": ["jack"], "fields": ["description"]}));

        f.api.set_users(vec![profile("42", "jack")]);
        f.cycle.run_cycle(&config).await.unwrap();
        let mut renamed = profile("42", "jack");
        renamed.name = "Someone Else".into();
        f.api.set_users(vec![renamed]);
        f.cycle.run_cycle(&config).await.unwrap();

        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn trackers_on_the_same_account_keep_separate_baselines() {
        let f = fixture();
        let first = TrackerConfig::with_id("a", "a", TrackerType::Profile, json!({"usernames": ["jack"]}));
        let second = TrackerConfig::with_id("b", "b", TrackerType::Profile, json!({"usernames": ["jack"]}));
        let mut events = f.bus.subscribe(EventFilter::Tracker("b".into()));

        f.api.set_users(vec![profile("42", "jack")]);
        f.cycle.run_cycle(&first).await.unwrap();
        f.cycle.run_cycle(&second).await.unwrap();

        let mut renamed = profile("42", "jack");
        renamed.name = "Jack D".into();
        f.api.set_users(vec![renamed]);
        f.cycle.run_cycle(&first).await.unwrap();
        f.cycle.run_cycle(&second).await.unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(event.data["field"], "name");
        assert_eq!(event.data["old_value"], "jack");
        assert!(events.try_recv().is_none());
        assert_eq!(f.changes.for_user("42").await.unwrap().len(), 2);
    }

    #[test]
    fn validation() {
        let f = fixture();
        assert!(matches!(
            f.cycle.validate(&tracker(json!({"usernames": []}))),
            Err(Error::NoTargets(_))
        ));
        assert!(matches!(
            f.cycle.validate(&tracker(json!({"usernames": ["jack"], "fields": ["shoe_size"]}))),
            Err(Error::InvalidParameters { .. })
        ));
        f.cycle.validate(&tracker(json!({"usernames": ["jack"]}))).unwrap();
    }

    #[tokio::test]
    async fn upstream_failure_propagates() {
        let f = fixture();
        f.api.fail(true);
        let result = f.cycle.run_cycle(&tracker(json!({"usernames": ["jack"]}))).await;
        assert!(matches!(result, Err(Error::Upstream { .. })));
    }
}
