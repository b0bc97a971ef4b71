//! Change-detection math shared by the trackers: mention velocity, trend diffs, follower
//! deltas, profile field diffs and engagement spikes. Everything here is pure and clock-free;
//! callers pass `now`.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::types::{EngagementSnapshot, PostMetrics, TrendItem};

/// Mentions older than this are pruned from a [`MentionWindow`].
pub const MENTION_RETENTION_MINUTES: i64 = 30;

/// Prior snapshots required before engagement spikes are evaluated.
pub const MIN_ENGAGEMENT_HISTORY: usize = 3;

// ── Velocity ───────────────────────────────────────────────────────

/// Events at or after `now - window` divided by the window length, per minute.
pub fn velocity<'a>(
    timestamps: impl IntoIterator<Item = &'a DateTime<Utc>>,
    now: DateTime<Utc>,
    window_minutes: u32,
) -> f64 {
    if window_minutes == 0 {
        return 0.0;
    }
    let cutoff = now - Duration::minutes(i64::from(window_minutes));
    let count = timestamps.into_iter().filter(|t| **t >= cutoff).count();
    count as f64 / f64::from(window_minutes)
}

/// Recent mention timestamps per symbol.
#[derive(Debug, Clone, Default)]
pub struct MentionWindow {
    mentions: HashMap<String, VecDeque<DateTime<Utc>>>,
}

impl MentionWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, symbol: &str, at: DateTime<Utc>) {
        let entries = self.mentions.entry(symbol.to_string()).or_default();
        entries.push_back(at);
        let cutoff = at - Duration::minutes(MENTION_RETENTION_MINUTES);
        while entries.front().is_some_and(|t| *t < cutoff) {
            entries.pop_front();
        }
    }

    /// Mentions per minute over the trailing window. Windows longer than the retention
    /// period only see retained mentions.
    pub fn velocity(&self, symbol: &str, now: DateTime<Utc>, window_minutes: u32) -> f64 {
        self.mentions
            .get(symbol)
            .map(|entries| velocity(entries, now, window_minutes))
            .unwrap_or(0.0)
    }

    pub fn count(&self, symbol: &str) -> usize {
        self.mentions.get(symbol).map_or(0, VecDeque::len)
    }
}

// ── Trends ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RisingTrend {
    pub name: String,
    pub previous_count: u64,
    pub current_count: u64,
    pub change_pct: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrendDiff {
    pub new: Vec<TrendItem>,
    pub disappeared: Vec<TrendItem>,
    pub rising: Vec<RisingTrend>,
}

impl TrendDiff {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.disappeared.is_empty() && self.rising.is_empty()
    }
}

/// Strictly more than a 20% increase. A trend without a previous count never rises.
pub fn is_rising(previous: u64, current: u64) -> bool {
    previous > 0 && u128::from(current) * 5 > u128::from(previous) * 6
}

/// Case-insensitive substring allow-list. An empty list allows everything.
pub fn keyword_allows(name: &str, keywords: &[String]) -> bool {
    if keywords.is_empty() {
        return true;
    }
    let name = name.to_lowercase();
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .any(|k| !k.is_empty() && name.contains(&k))
}

/// Compare two trend lists by name.
pub fn diff_trends(previous: &[TrendItem], current: &[TrendItem], keywords: &[String]) -> TrendDiff {
    let before: HashMap<&str, &TrendItem> = previous.iter().map(|t| (t.name.as_str(), t)).collect();
    let after: HashMap<&str, &TrendItem> = current.iter().map(|t| (t.name.as_str(), t)).collect();
    let mut diff = TrendDiff::default();

    for trend in current.iter().filter(|t| keyword_allows(&t.name, keywords)) {
        match before.get(trend.name.as_str()) {
            None => diff.new.push(trend.clone()),
            Some(old) => {
                let (Some(prev), Some(cur)) = (old.count, trend.count) else {
                    continue;
                };
                if is_rising(prev, cur) {
                    diff.rising.push(RisingTrend {
                        name: trend.name.clone(),
                        previous_count: prev,
                        current_count: cur,
                        change_pct: (cur as f64 - prev as f64) / prev as f64 * 100.0,
                    });
                }
            }
        }
    }
    diff.disappeared = previous
        .iter()
        .filter(|t| !after.contains_key(t.name.as_str()) && keyword_allows(&t.name, keywords))
        .cloned()
        .collect();
    diff
}

// ── Followers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountChange {
    pub previous: u64,
    pub current: u64,
    pub change: i64,
    /// `None` when the previous count was zero.
    pub change_pct: Option<f64>,
}

impl CountChange {
    pub fn increased(&self) -> bool {
        self.change > 0
    }
}

/// `None` when the count did not move.
pub fn count_change(previous: u64, current: u64) -> Option<CountChange> {
    if previous == current {
        return None;
    }
    let change = current as i64 - previous as i64;
    Some(CountChange {
        previous,
        current,
        change,
        change_pct: (previous > 0).then(|| change as f64 / previous as f64 * 100.0),
    })
}

// ── Profiles ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub old_value: String,
    pub new_value: String,
}

/// Fields whose value differs. Fields missing from either side have no baseline and are skipped.
pub fn diff_fields(
    previous: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
) -> Vec<FieldChange> {
    current
        .iter()
        .filter_map(|(field, new_value)| {
            let old_value = previous.get(field)?;
            (old_value != new_value).then(|| FieldChange {
                field: field.clone(),
                old_value: old_value.clone(),
                new_value: new_value.clone(),
            })
        })
        .collect()
}

// ── Engagement ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementMetric {
    Likes,
    Retweets,
    Replies,
}

impl EngagementMetric {
    pub const ALL: [EngagementMetric; 3] = [
        EngagementMetric::Likes,
        EngagementMetric::Retweets,
        EngagementMetric::Replies,
    ];

    pub fn value(self, metrics: &PostMetrics) -> u64 {
        match self {
            EngagementMetric::Likes => metrics.likes,
            EngagementMetric::Retweets => metrics.retweets,
            EngagementMetric::Replies => metrics.replies,
        }
    }
}

/// Which condition declared a spike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpikeTrigger {
    Multiplier,
    Threshold,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpikeRule {
    pub multiplier: f64,
    /// Absolute per-minute rate; spikes regardless of history when exceeded.
    pub threshold: Option<f64>,
}

impl Default for SpikeRule {
    fn default() -> Self {
        Self {
            multiplier: 3.0,
            threshold: None,
        }
    }
}

impl SpikeRule {
    /// Conditions met by `observed` against `average`. Empty means no spike.
    pub fn triggers(&self, observed: f64, average: f64) -> Vec<SpikeTrigger> {
        let mut triggers = Vec::new();
        if average > 0.0 && observed > average * self.multiplier {
            triggers.push(SpikeTrigger::Multiplier);
        }
        if self.threshold.is_some_and(|t| observed > t) {
            triggers.push(SpikeTrigger::Threshold);
        }
        triggers
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSpike {
    pub metric: EngagementMetric,
    pub current: u64,
    pub observed_rate: f64,
    pub historical_rate: f64,
    pub triggers: Vec<SpikeTrigger>,
}

fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}

/// Sum of deltas over sum of elapsed minutes across consecutive pairs (oldest first).
pub fn historical_rate(history: &[&EngagementSnapshot], metric: EngagementMetric) -> f64 {
    let mut delta = 0.0;
    let mut minutes = 0.0;
    for pair in history.windows(2) {
        delta += metric.value(&pair[1].metrics) as f64 - metric.value(&pair[0].metrics) as f64;
        minutes += minutes_between(pair[0].captured_at, pair[1].captured_at);
    }
    if minutes > 0.0 { delta / minutes } else { 0.0 }
}

/// Spikes of `current` against the stored history of one post.
///
/// Needs [`MIN_ENGAGEMENT_HISTORY`] prior snapshots; with fewer, or when no time has passed
/// since the latest one, nothing is reported.
pub fn engagement_spikes(
    history: &[EngagementSnapshot],
    current: &PostMetrics,
    now: DateTime<Utc>,
    rule: &SpikeRule,
) -> Vec<MetricSpike> {
    if history.len() < MIN_ENGAGEMENT_HISTORY {
        return Vec::new();
    }
    let mut ordered: Vec<&EngagementSnapshot> = history.iter().collect();
    ordered.sort_by_key(|s| s.captured_at);
    let Some(latest) = ordered.last() else {
        return Vec::new();
    };
    let elapsed = minutes_between(latest.captured_at, now);
    if elapsed <= 0.0 {
        return Vec::new();
    }

    EngagementMetric::ALL
        .into_iter()
        .filter_map(|metric| {
            let value = metric.value(current);
            let observed = (value as f64 - metric.value(&latest.metrics) as f64) / elapsed;
            let average = historical_rate(&ordered, metric);
            let triggers = rule.triggers(observed, average);
            (!triggers.is_empty()).then_some(MetricSpike {
                metric,
                current: value,
                observed_rate: observed,
                historical_rate: average,
                triggers,
            })
        })
        .collect()
}
