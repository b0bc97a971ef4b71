//! Detection strategies and the manager that routes lifecycle calls to them.
//!
//! Every tracker is owned by exactly one strategy, chosen by its persisted type. Stream
//! strategies share the feed multiplexer; poll strategies run one periodic task per tracker.

pub mod cashtag;
pub mod engagement;
pub mod follower;
pub mod hashtag;
pub mod keyword;
pub mod poller;
pub mod profile;
pub mod stream;
pub mod trend;
pub mod user;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::api::UpstreamApi;
use crate::bus::{EventBus, EventFilter, Subscription};
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::feed::RuleMultiplexer;
use crate::store::{
    ChangeLogStore, MemoryChangeLog, MemoryPostStore, MemorySnapshotStore, MemoryTrackerStore,
    PostStore, SnapshotStore, TrackerStore,
};
use crate::types::{
    EngagementSnapshot, FollowerSnapshot, ProfileSnapshot, TrackerConfig, TrackerStatus,
    TrackerType, TrendSnapshot,
};

use cashtag::CashtagMatcher;
use engagement::EngagementCycle;
use follower::FollowerCycle;
use hashtag::HashtagMatcher;
use keyword::KeywordMatcher;
use poller::PollingTracker;
use profile::ProfileCycle;
use stream::{StreamDeps, StreamingTracker};
use trend::TrendCycle;
use user::UserMatcher;

const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Lifecycle contract shared by all eight strategies.
#[async_trait]
pub trait TrackerStrategy: Send + Sync {
    fn tracker_type(&self) -> TrackerType;

    /// Begin tracking. Starting a running tracker is a no-op.
    async fn start(&self, id: &str) -> Result<()>;

    /// Stop tracking and mark the tracker paused. Stopping an idle tracker is a no-op.
    async fn stop(&self, id: &str) -> Result<()>;

    async fn is_running(&self, id: &str) -> bool;

    /// Release everything this strategy runs. Persisted status is left as is.
    async fn shutdown(&self);
}

/// Load a tracker and check it belongs to the calling strategy.
pub(crate) async fn load_tracker(
    store: &dyn TrackerStore,
    id: &str,
    expected: TrackerType,
) -> Result<TrackerConfig> {
    let tracker = store
        .get(id)
        .await?
        .ok_or_else(|| Error::TrackerNotFound(id.to_string()))?;
    if tracker.tracker_type != expected {
        return Err(Error::invalid_parameters(
            id,
            format!("{} tracker cannot run under the {expected} strategy", tracker.tracker_type),
        ));
    }
    Ok(tracker)
}

/// Decode a tracker's parameters. Absent parameters decode as an empty object.
pub(crate) fn parse_params<T: DeserializeOwned>(tracker: &TrackerConfig) -> Result<T> {
    let value = if tracker.parameters.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        tracker.parameters.clone()
    };
    serde_json::from_value(value).map_err(|e| Error::invalid_parameters(&tracker.id, e.to_string()))
}

/// Trim, drop a leading `@`, drop blanks and case-insensitive duplicates.
pub(crate) fn clean_usernames(usernames: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(usernames.len());
    for name in usernames {
        let name = name.trim().trim_start_matches('@');
        if !name.is_empty() && !out.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            out.push(name.to_string());
        }
    }
    out
}

/// Stores, clients and channels the strategies are built from.
#[derive(Clone)]
pub struct Services {
    pub trackers: Arc<dyn TrackerStore>,
    pub posts: Arc<dyn PostStore>,
    pub profiles: Arc<dyn SnapshotStore<ProfileSnapshot>>,
    pub followers: Arc<dyn SnapshotStore<FollowerSnapshot>>,
    pub trends: Arc<dyn SnapshotStore<TrendSnapshot>>,
    pub engagement: Arc<dyn SnapshotStore<EngagementSnapshot>>,
    pub changes: Arc<dyn ChangeLogStore>,
    pub api: Arc<dyn UpstreamApi>,
    pub multiplexer: RuleMultiplexer,
    pub bus: EventBus,
}

impl Services {
    /// Wire the given clients to fresh in-memory stores.
    pub fn in_memory(api: Arc<dyn UpstreamApi>, multiplexer: RuleMultiplexer, bus: EventBus) -> Self {
        Self {
            trackers: Arc::new(MemoryTrackerStore::new()),
            posts: Arc::new(MemoryPostStore::new()),
            profiles: Arc::new(MemorySnapshotStore::<ProfileSnapshot>::new()),
            followers: Arc::new(MemorySnapshotStore::<FollowerSnapshot>::new()),
            trends: Arc::new(MemorySnapshotStore::<TrendSnapshot>::new()),
            engagement: Arc::new(MemorySnapshotStore::<EngagementSnapshot>::new()),
            changes: Arc::new(MemoryChangeLog::new()),
            api,
            multiplexer,
            bus,
        }
    }
}

/// Entry point for operators: CRUD on tracker records plus lifecycle calls routed by type.
pub struct TrackerManager {
    store: Arc<dyn TrackerStore>,
    strategies: HashMap<TrackerType, Arc<dyn TrackerStrategy>>,
    cashtag: Arc<StreamingTracker<CashtagMatcher>>,
    multiplexer: RuleMultiplexer,
    bus: EventBus,
}

impl TrackerManager {
    pub fn new(services: Services, config: &AppConfig) -> Self {
        let stream = StreamDeps {
            trackers: Arc::clone(&services.trackers),
            posts: Arc::clone(&services.posts),
            multiplexer: services.multiplexer.clone(),
            bus: services.bus.clone(),
            max_rule_length: config.stream.max_rule_length,
        };
        let every = |t: TrackerType| config.intervals.for_type(t).unwrap_or(FALLBACK_POLL_INTERVAL);

        let cashtag = Arc::new(StreamingTracker::new(CashtagMatcher::new(), stream.clone()));
        let strategies: Vec<Arc<dyn TrackerStrategy>> = vec![
            Arc::new(StreamingTracker::new(
                UserMatcher::new(Arc::clone(&services.api)),
                stream.clone(),
            )),
            Arc::new(StreamingTracker::new(HashtagMatcher, stream.clone())),
            Arc::new(StreamingTracker::new(KeywordMatcher, stream)),
            cashtag.clone(),
            Arc::new(PollingTracker::new(
                ProfileCycle::new(
                    Arc::clone(&services.api),
                    Arc::clone(&services.profiles),
                    Arc::clone(&services.changes),
                    services.bus.clone(),
                ),
                Arc::clone(&services.trackers),
                every(TrackerType::Profile),
            )),
            Arc::new(PollingTracker::new(
                FollowerCycle::new(
                    Arc::clone(&services.api),
                    Arc::clone(&services.followers),
                    services.bus.clone(),
                ),
                Arc::clone(&services.trackers),
                every(TrackerType::Follower),
            )),
            Arc::new(PollingTracker::new(
                TrendCycle::new(
                    Arc::clone(&services.api),
                    Arc::clone(&services.trends),
                    services.bus.clone(),
                ),
                Arc::clone(&services.trackers),
                every(TrackerType::Trend),
            )),
            Arc::new(PollingTracker::new(
                EngagementCycle::new(
                    Arc::clone(&services.api),
                    Arc::clone(&services.engagement),
                    services.bus.clone(),
                    config.pacer.clone(),
                ),
                Arc::clone(&services.trackers),
                every(TrackerType::Engagement),
            )),
        ];

        Self {
            store: services.trackers,
            strategies: strategies.into_iter().map(|s| (s.tracker_type(), s)).collect(),
            cashtag,
            multiplexer: services.multiplexer,
            bus: services.bus,
        }
    }

    fn strategy(&self, tracker: &TrackerConfig) -> Result<&Arc<dyn TrackerStrategy>> {
        self.strategies.get(&tracker.tracker_type).ok_or_else(|| {
            Error::invalid_parameters(
                &tracker.id,
                format!("no strategy for type {}", tracker.tracker_type),
            )
        })
    }

    /// Create a paused tracker with a generated id.
    pub async fn create(
        &self,
        name: &str,
        tracker_type: TrackerType,
        parameters: serde_json::Value,
    ) -> Result<TrackerConfig> {
        let tracker = TrackerConfig::new(name, tracker_type, parameters);
        self.store.insert(tracker.clone()).await?;
        info!("[{}] Created {tracker_type} tracker \"{name}\"", tracker.id);
        Ok(tracker)
    }

    /// Insert a tracker unless one with its id exists. Returns whether it was inserted.
    pub async fn register(&self, tracker: TrackerConfig) -> Result<bool> {
        if self.store.get(&tracker.id).await?.is_some() {
            return Ok(false);
        }
        self.store.insert(tracker).await?;
        Ok(true)
    }

    pub async fn get(&self, id: &str) -> Result<TrackerConfig> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::TrackerNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<TrackerConfig>> {
        self.store.list().await
    }

    /// Delete a stopped tracker.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let tracker = self.get(id).await?;
        if self.strategy(&tracker)?.is_running(id).await {
            return Err(Error::TrackerRunning(id.to_string()));
        }
        self.store.delete(id).await?;
        info!("[{id}] Deleted");
        Ok(())
    }

    /// Start a tracker under the strategy its type names.
    ///
    /// Configuration errors are returned untouched; any other failure also marks the tracker
    /// `ERROR`.
    pub async fn start(&self, id: &str) -> Result<()> {
        let tracker = self.get(id).await?;
        let result = self.strategy(&tracker)?.start(id).await;
        match &result {
            Err(e) if !e.is_config() => self.mark_error(id, e).await,
            _ => {}
        }
        result
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        let tracker = self.get(id).await?;
        self.strategy(&tracker)?.stop(id).await
    }

    pub async fn is_running(&self, id: &str) -> Result<bool> {
        let tracker = self.get(id).await?;
        Ok(self.strategy(&tracker)?.is_running(id).await)
    }

    /// Start every tracker left `ACTIVE` or `ERROR` by a previous run.
    ///
    /// Returns the ids that failed to start; those are marked `ERROR`.
    pub async fn resume_active(&self) -> Result<Vec<String>> {
        let trackers = self
            .store
            .list_by_status(&[TrackerStatus::Active, TrackerStatus::Error])
            .await?;
        let mut failed = Vec::new();
        for tracker in trackers {
            match self.start(&tracker.id).await {
                Ok(()) => info!("[{}] Resumed {} tracker", tracker.id, tracker.tracker_type),
                Err(e) => {
                    warn!("[{}] Failed to resume: {e}", tracker.id);
                    if e.is_config() {
                        self.mark_error(&tracker.id, &e).await;
                    }
                    failed.push(tracker.id);
                }
            }
        }
        Ok(failed)
    }

    /// Stop every strategy, then close the feed connection.
    pub async fn shutdown(&self) {
        for strategy in self.strategies.values() {
            strategy.shutdown().await;
        }
        if let Err(e) = self.multiplexer.disconnect().await {
            warn!("Feed disconnect failed during shutdown: {e}");
        }
        info!("Tracker manager shut down");
    }

    /// Mentions per minute of `symbol` seen by a cashtag tracker.
    ///
    /// `window_minutes` defaults to the tracker's configured window.
    pub async fn velocity(
        &self,
        tracker_id: &str,
        symbol: &str,
        window_minutes: Option<u32>,
    ) -> Result<f64> {
        let tracker = self.get(tracker_id).await?;
        if tracker.tracker_type != TrackerType::Cashtag {
            return Err(Error::invalid_parameters(
                tracker_id,
                format!("velocity needs a cashtag tracker, not {}", tracker.tracker_type),
            ));
        }
        self.cashtag.matcher().velocity(&tracker, symbol, window_minutes)
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.bus.subscribe(filter)
    }

    async fn mark_error(&self, id: &str, e: &Error) {
        if let Err(store_err) = self
            .store
            .set_status(id, TrackerStatus::Error, Some(e.to_string()))
            .await
        {
            warn!("[{id}] Failed to record error status: {store_err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use crate::types::EventKind;
    use serde_json::json;

    #[test]
    fn usernames_are_cleaned() {
        let raw = vec![" @Jack ".to_string(), "jack".to_string(), "".to_string(), "elon".to_string()];
        assert_eq!(clean_usernames(&raw), vec!["Jack", "elon"]);
    }

    #[test]
    fn null_parameters_decode_as_empty() {
        #[derive(serde::Deserialize)]
        struct Params {
            #[serde(default)]
            hashtags: Vec<String>,
        }
        let tracker = TrackerConfig::with_id("t1", "x", TrackerType::Hashtag, serde_json::Value::Null);
        let params: Params = parse_params(&tracker).unwrap();
        assert!(params.hashtags.is_empty());

        let bad = TrackerConfig::with_id("t2", "x", TrackerType::Hashtag, json!({"hashtags": 5}));
        assert!(matches!(
            parse_params::<Params>(&bad),
            Err(Error::InvalidParameters { .. })
        ));
    }

    #[tokio::test]
    async fn routes_start_and_stop_by_type() {
        let h = Harness::new();
        let tracker = h
            .manager
            .create("rust", TrackerType::Hashtag, json!({"hashtags": ["rust"]}))
            .await
            .unwrap();

        h.manager.start(&tracker.id).await.unwrap();
        assert!(h.manager.is_running(&tracker.id).await.unwrap());
        assert_eq!(h.manager.get(&tracker.id).await.unwrap().status, TrackerStatus::Active);

        h.manager.stop(&tracker.id).await.unwrap();
        assert!(!h.manager.is_running(&tracker.id).await.unwrap());
        assert_eq!(h.manager.get(&tracker.id).await.unwrap().status, TrackerStatus::Paused);
    }

    #[tokio::test]
    async fn unknown_tracker_is_not_found() {
        let h = Harness::new();
        assert!(matches!(h.manager.start("nope").await, Err(Error::TrackerNotFound(_))));
        assert!(matches!(h.manager.stop("nope").await, Err(Error::TrackerNotFound(_))));
    }

    #[tokio::test]
    async fn delete_requires_stop() {
        let h = Harness::new();
        let tracker = h
            .manager
            .create("btc", TrackerType::Cashtag, json!({"symbols": ["BTC"]}))
            .await
            .unwrap();
        h.manager.start(&tracker.id).await.unwrap();

        assert!(matches!(
            h.manager.delete(&tracker.id).await,
            Err(Error::TrackerRunning(_))
        ));
        h.manager.stop(&tracker.id).await.unwrap();
        h.manager.delete(&tracker.id).await.unwrap();
        assert!(matches!(
            h.manager.get(&tracker.id).await,
            Err(Error::TrackerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn config_error_leaves_status_alone() {
        let h = Harness::new();
        let tracker = h
            .manager
            .create("empty", TrackerType::Keyword, json!({"keywords": []}))
            .await
            .unwrap();
        assert!(matches!(
            h.manager.start(&tracker.id).await,
            Err(Error::NoTargets(_))
        ));
        assert_eq!(h.manager.get(&tracker.id).await.unwrap().status, TrackerStatus::Paused);
        assert!(h.transport.rules().is_empty());
    }

    #[tokio::test]
    async fn resume_restarts_active_and_errored() {
        let h = Harness::new();
        let mut active = TrackerConfig::with_id("a", "a", TrackerType::Hashtag, json!({"hashtags": ["a"]}));
        active.status = TrackerStatus::Active;
        let mut errored = TrackerConfig::with_id("b", "b", TrackerType::Keyword, json!({"keywords": ["b"]}));
        errored.status = TrackerStatus::Error;
        let mut broken = TrackerConfig::with_id("c", "c", TrackerType::Keyword, json!({}));
        broken.status = TrackerStatus::Active;
        let paused = TrackerConfig::with_id("d", "d", TrackerType::Hashtag, json!({"hashtags": ["d"]}));
        for t in [active, errored, broken, paused] {
            assert!(h.manager.register(t).await.unwrap());
        }

        let failed = h.manager.resume_active().await.unwrap();
        assert_eq!(failed, vec!["c"]);
        assert!(h.manager.is_running("a").await.unwrap());
        assert!(h.manager.is_running("b").await.unwrap());
        assert!(!h.manager.is_running("d").await.unwrap());
        assert_eq!(h.manager.get("b").await.unwrap().status, TrackerStatus::Active);
        assert_eq!(h.manager.get("c").await.unwrap().status, TrackerStatus::Error);
    }

    #[tokio::test]
    async fn shutdown_keeps_status_for_resume() {
        let h = Harness::new();
        let tracker = h
            .manager
            .create("rust", TrackerType::Hashtag, json!({"hashtags": ["rust"]}))
            .await
            .unwrap();
        h.manager.start(&tracker.id).await.unwrap();

        h.manager.shutdown().await;
        assert!(!h.manager.is_running(&tracker.id).await.unwrap());
        assert!(!h.multiplexer.is_connected());
        assert_eq!(h.manager.get(&tracker.id).await.unwrap().status, TrackerStatus::Active);
    }

    #[tokio::test]
    async fn velocity_only_for_cashtag() {
        let h = Harness::new();
        let tracker = h
            .manager
            .create("rust", TrackerType::Hashtag, json!({"hashtags": ["rust"]}))
            .await
            .unwrap();
        assert!(matches!(
            h.manager.velocity(&tracker.id, "BTC", None).await,
            Err(Error::InvalidParameters { .. })
        ));

        let btc = h
            .manager
            .create("btc", TrackerType::Cashtag, json!({"symbols": ["BTC"]}))
            .await
            .unwrap();
        assert_eq!(h.manager.velocity(&btc.id, "btc", Some(5)).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn subscription_sees_stream_events() {
        let h = Harness::new();
        let tracker = h
            .manager
            .create("rust", TrackerType::Hashtag, json!({"hashtags": ["rust"]}))
            .await
            .unwrap();
        let mut events = h.manager.subscribe(EventFilter::Tracker(tracker.id.clone()));
        h.manager.start(&tracker.id).await.unwrap();

        let tag = crate::feed::rules::rule_tag(&tracker.id);
        h.transport
            .push(crate::testing::feed_item("p1", &[tag.as_str()]))
            .await;
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, EventKind::NewTweet);
        assert_eq!(event.data["post"]["id"], "p1");
    }
}
