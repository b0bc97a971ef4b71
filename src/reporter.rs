use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{EventKind, TrackerEvent};

/// Emit a tracker event as a single JSON line to stdout.
pub fn report_event(event: &TrackerEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{json}");
    }
}

/// Emit the run summary as pretty-printed JSON to stdout.
pub fn report_summary(summary: &RunSummary) {
    if let Ok(json) = serde_json::to_string_pretty(summary) {
        println!("{json}");
    }
}

/// Event counts accumulated while the daemon runs.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub events: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_tracker: BTreeMap<String, u64>,
    /// Events the reporter skipped because it fell behind.
    pub missed: u64,
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            events: 0,
            by_type: BTreeMap::new(),
            by_tracker: BTreeMap::new(),
            missed: 0,
        }
    }

    pub fn record(&mut self, event: &TrackerEvent) {
        self.events += 1;
        *self.by_type.entry(kind_name(event.event_type)).or_default() += 1;
        *self.by_tracker.entry(event.tracker_id.clone()).or_default() += 1;
    }

    pub fn finish(&mut self, missed: u64) {
        self.missed = missed;
        self.finished_at = Some(Utc::now());
    }
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_name(kind: EventKind) -> String {
    serde_json::to_value(kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{kind:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrackerType;
    use serde_json::json;

    #[test]
    fn summary_counts_by_type_and_tracker() {
        let mut summary = RunSummary::new();
        for (id, kind) in [
            ("t1", EventKind::NewTweet),
            ("t1", EventKind::VelocitySpike),
            ("t2", EventKind::NewTweet),
        ] {
            summary.record(&TrackerEvent::new(id, TrackerType::Cashtag, kind, json!({})));
        }
        summary.finish(4);

        assert_eq!(summary.events, 3);
        assert_eq!(summary.by_type["new_tweet"], 2);
        assert_eq!(summary.by_type["velocity_spike"], 1);
        assert_eq!(summary.by_tracker["t1"], 2);
        assert_eq!(summary.missed, 4);
        assert!(summary.finished_at.is_some());
    }
}
