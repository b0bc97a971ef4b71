use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::api::UpstreamApi;
use crate::bus::EventBus;
use crate::detect::diff_trends;
use crate::error::{Error, Result};
use crate::store::SnapshotStore;
use crate::trackers::parse_params;
use crate::trackers::poller::PollCycle;
use crate::types::{EventKind, TrackerConfig, TrackerEvent, TrackerType, TrendSnapshot};

fn default_woeid() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct TrendParams {
    /// Yahoo "where on earth" id; 1 is worldwide.
    #[serde(default = "default_woeid")]
    woeid: u32,
    #[serde(default)]
    keywords: Vec<String>,
}

pub fn region_id(woeid: u32) -> String {
    format!("woeid:{woeid}")
}

/// Watches the trend list of one region.
pub struct TrendCycle {
    api: Arc<dyn UpstreamApi>,
    snapshots: Arc<dyn SnapshotStore<TrendSnapshot>>,
    bus: EventBus,
}

impl TrendCycle {
    pub fn new(
        api: Arc<dyn UpstreamApi>,
        snapshots: Arc<dyn SnapshotStore<TrendSnapshot>>,
        bus: EventBus,
    ) -> Self {
        Self { api, snapshots, bus }
    }

    fn publish(&self, tracker: &TrackerConfig, kind: EventKind, data: serde_json::Value) {
        self.bus
            .publish(TrackerEvent::new(&tracker.id, TrackerType::Trend, kind, data));
    }
}

#[async_trait]
impl PollCycle for TrendCycle {
    fn tracker_type(&self) -> TrackerType {
        TrackerType::Trend
    }

    fn validate(&self, tracker: &TrackerConfig) -> Result<()> {
        let params: TrendParams = parse_params(tracker)?;
        if params.woeid == 0 {
            return Err(Error::invalid_parameters(&tracker.id, "woeid must be positive"));
        }
        Ok(())
    }

    async fn run_cycle(&self, tracker: &TrackerConfig) -> Result<()> {
        let params: TrendParams = parse_params(tracker)?;
        let region = region_id(params.woeid);
        let trends = self.api.trends_by_region(params.woeid).await?;

        let previous = self.snapshots.latest(&tracker.id, &region).await?;
        self.snapshots
            .append(TrendSnapshot {
                tracker_id: tracker.id.clone(),
                region_id: region.clone(),
                trends: trends.clone(),
                captured_at: Utc::now(),
            })
            .await?;
        let Some(previous) = previous else {
            debug!("[{}] Baseline of {} trend(s) for {region}", tracker.id, trends.len());
            return Ok(());
        };

        let diff = diff_trends(&previous.trends, &trends, &params.keywords);
        debug!(
            "[{}] {region}: {} new, {} gone, {} rising",
            tracker.id,
            diff.new.len(),
            diff.disappeared.len(),
            diff.rising.len()
        );
        for trend in diff.new {
            self.publish(
                tracker,
                EventKind::NewTrend,
                json!({"woeid": params.woeid, "name": trend.name, "count": trend.count}),
            );
        }
        for trend in diff.disappeared {
            self.publish(
                tracker,
                EventKind::DisappearedTrend,
                json!({"woeid": params.woeid, "name": trend.name, "count": trend.count}),
            );
        }
        for rising in diff.rising {
            self.publish(
                tracker,
                EventKind::RisingTrend,
                json!({
                    "woeid": params.woeid,
                    "name": rising.name,
                    "previous_count": rising.previous_count,
                    "current_count": rising.current_count,
                    "change_pct": rising.change_pct,
                }),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventFilter;
    use crate::store::MemorySnapshotStore;
    use crate::testing::FakeApi;
    use crate::types::TrendItem;

    fn trend(name: &str, count: u64) -> TrendItem {
        TrendItem {
            name: name.into(),
            count: Some(count),
        }
    }

    fn setup() -> (Arc<FakeApi>, EventBus, TrendCycle) {
        let api = Arc::new(FakeApi::default());
        let bus = EventBus::new(64);
        let cycle = TrendCycle::new(api.clone(), Arc::new(MemorySnapshotStore::<TrendSnapshot>::new()), bus.clone());
        (api, bus, cycle)
    }

    #[tokio::test]
    async fn emits_new_disappeared_and_rising() {
        let (api, bus, cycle) = setup();
        let mut events = bus.subscribe(EventFilter::All);
        let tracker = TrackerConfig::with_id("t1", "world", TrackerType::Trend, json!({}));

        api.set_trends(vec![trend("#rust", 100), trend("#go", 100)]);
        cycle.run_cycle(&tracker).await.unwrap();
        assert!(events.try_recv().is_none());

        api.set_trends(vec![trend("#rust", 121), trend("#zig", 10)]);
        cycle.run_cycle(&tracker).await.unwrap();

        let mut seen = Vec::new();
        while let Some(e) = events.try_recv() {
            seen.push((e.event_type, e.data["name"].as_str().unwrap().to_string()));
        }
        assert_eq!(
            seen,
            vec![
                (EventKind::NewTrend, "#zig".to_string()),
                (EventKind::DisappearedTrend, "#go".to_string()),
                (EventKind::RisingTrend, "#rust".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn keyword_allow_list() {
        let (api, bus, cycle) = setup();
        let mut events = bus.subscribe(EventFilter::All);
        let tracker = TrackerConfig::with_id(
            "t1",
            "world",
            TrackerType::Trend,
            json!({"woeid": 23424977, "keywords": ["Rust"]}),
        );

        api.set_trends(vec![trend("#go", 100)]);
        cycle.run_cycle(&tracker).await.unwrap();
        api.set_trends(vec![trend("#go", 100), trend("#rustlang", 5), trend("#zig", 5)]);
        cycle.run_cycle(&tracker).await.unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(event.data["name"], "#rustlang");
        assert_eq!(event.data["woeid"], 23424977);
        assert!(events.try_recv().is_none());
        assert_eq!(api.trend_requests(), vec![23424977, 23424977]);
    }

    #[tokio::test]
    async fn trackers_on_one_region_diff_independently() {
        let (api, bus, cycle) = setup();
        let mut events = bus.subscribe(EventFilter::Tracker("b".into()));
        let a = TrackerConfig::with_id("a", "all", TrackerType::Trend, json!({}));
        let b = TrackerConfig::with_id("b", "rust", TrackerType::Trend, json!({"keywords": ["rust"]}));

        api.set_trends(vec![trend("#go", 100)]);
        cycle.run_cycle(&a).await.unwrap();
        cycle.run_cycle(&b).await.unwrap();

        api.set_trends(vec![trend("#go", 100), trend("#rust", 40)]);
        cycle.run_cycle(&a).await.unwrap();
        cycle.run_cycle(&b).await.unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(event.event_type, EventKind::NewTrend);
        assert_eq!(event.data["name"], "#rust");
        assert!(events.try_recv().is_none());
    }

    #[test]
    fn zero_woeid_is_invalid() {
        let (_api, _bus, cycle) = setup();
        let tracker = TrackerConfig::with_id("t1", "x", TrackerType::Trend, json!({"woeid": 0}));
        assert!(matches!(cycle.validate(&tracker), Err(Error::InvalidParameters { .. })));
    }
}
