//! Cashtag tracking with per-symbol mention velocity.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::detect::MentionWindow;
use crate::error::{Error, Result};
use crate::feed::rules::{cashtag_term, normalize_symbol};
use crate::trackers::parse_params;
use crate::trackers::stream::StreamMatcher;
use crate::types::{EventKind, Post, TrackerConfig, TrackerType};

fn default_window() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct CashtagParams {
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Mentions per minute at or above which a `velocity_spike` is emitted.
    #[serde(default)]
    pub spike_threshold: Option<f64>,
    #[serde(default = "default_window")]
    pub window_minutes: u32,
}

impl CashtagParams {
    fn parse(tracker: &TrackerConfig) -> Result<Self> {
        let params: Self = parse_params(tracker)?;
        if params.window_minutes == 0 {
            return Err(Error::invalid_parameters(&tracker.id, "window_minutes must be positive"));
        }
        if params.spike_threshold.is_some_and(|t| !t.is_finite() || t < 0.0) {
            return Err(Error::invalid_parameters(
                &tracker.id,
                "spike_threshold must be a non-negative number",
            ));
        }
        Ok(params)
    }
}

struct CashtagState {
    symbols: Vec<String>,
    spike_threshold: Option<f64>,
    window_minutes: u32,
    mentions: MentionWindow,
}

#[derive(Default)]
pub struct CashtagMatcher {
    states: Mutex<HashMap<String, CashtagState>>,
}

impl CashtagMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mentions per minute of `symbol` over the trailing window.
    pub fn velocity(
        &self,
        tracker: &TrackerConfig,
        symbol: &str,
        window_minutes: Option<u32>,
    ) -> Result<f64> {
        let symbol = normalize_symbol(symbol)
            .ok_or_else(|| Error::invalid_parameters(&tracker.id, format!("invalid symbol {symbol:?}")))?;
        if window_minutes == Some(0) {
            return Err(Error::invalid_parameters(&tracker.id, "window must be positive"));
        }

        let states = self.states.lock();
        match states.get(&tracker.id) {
            Some(state) => Ok(state.mentions.velocity(
                &symbol,
                Utc::now(),
                window_minutes.unwrap_or(state.window_minutes),
            )),
            // Never started: nothing recorded yet
            None => CashtagParams::parse(tracker).map(|_| 0.0),
        }
    }
}

#[async_trait]
impl StreamMatcher for CashtagMatcher {
    fn tracker_type(&self) -> TrackerType {
        TrackerType::Cashtag
    }

    async fn terms(&self, tracker: &TrackerConfig) -> Result<Vec<String>> {
        let params = CashtagParams::parse(tracker)?;
        Ok(params.symbols.iter().filter_map(|s| cashtag_term(s)).collect())
    }

    async fn on_start(&self, tracker: &TrackerConfig) -> Result<()> {
        let params = CashtagParams::parse(tracker)?;
        let mut symbols: Vec<String> = params.symbols.iter().filter_map(|s| normalize_symbol(s)).collect();
        symbols.sort();
        symbols.dedup();

        let mut states = self.states.lock();
        match states.get_mut(&tracker.id) {
            // Restarts keep the mentions already counted
            Some(state) => {
                state.symbols = symbols;
                state.spike_threshold = params.spike_threshold;
                state.window_minutes = params.window_minutes;
            }
            None => {
                states.insert(
                    tracker.id.clone(),
                    CashtagState {
                        symbols,
                        spike_threshold: params.spike_threshold,
                        window_minutes: params.window_minutes,
                        mentions: MentionWindow::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn on_post(&self, tracker_id: &str, post: &Post) -> Result<Vec<(EventKind, Value)>> {
        let now = Utc::now();
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(tracker_id) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<String> = post
            .cashtags
            .iter()
            .filter_map(|s| normalize_symbol(s))
            .filter(|s| state.symbols.contains(s))
            .collect();
        matched.sort();
        matched.dedup();
        for symbol in &matched {
            state.mentions.record(symbol, now);
        }

        let Some(threshold) = state.spike_threshold else {
            return Ok(Vec::new());
        };
        let events = matched
            .into_iter()
            .filter_map(|symbol| {
                let velocity = state.mentions.velocity(&symbol, now, state.window_minutes);
                (velocity >= threshold).then(|| {
                    (
                        EventKind::VelocitySpike,
                        json!({
                            "symbol": symbol,
                            "velocity": velocity,
                            "threshold": threshold,
                            "window_minutes": state.window_minutes,
                            "mentions": state.mentions.count(&symbol),
                            "post_id": post.id,
                        }),
                    )
                })
            })
            .collect();
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventFilter;
    use crate::testing::{Harness, feed_item_with_text, post};
    use serde_json::json;

    fn tracker(params: Value) -> TrackerConfig {
        TrackerConfig::with_id("t1", "crypto", TrackerType::Cashtag, params)
    }

    #[tokio::test]
    async fn symbols_are_normalized() {
        let matcher = CashtagMatcher::new();
        let terms = matcher
            .terms(&tracker(json!({"symbols": ["btc", "$ETH", "B-T-C"]})))
            .await
            .unwrap();
        assert_eq!(terms, vec!["$BTC", "$ETH"]);
    }

    #[tokio::test]
    async fn zero_window_is_rejected() {
        let matcher = CashtagMatcher::new();
        let result = matcher
            .terms(&tracker(json!({"symbols": ["BTC"], "window_minutes": 0})))
            .await;
        assert!(matches!(result, Err(Error::InvalidParameters { .. })));
    }

    #[tokio::test]
    async fn mentions_feed_velocity() {
        let matcher = CashtagMatcher::new();
        let config = tracker(json!({"symbols": ["BTC", "ETH"], "window_minutes": 5}));
        matcher.on_start(&config).await.unwrap();

        for id in ["1", "2"] {
            let events = matcher
                .on_post("t1", &post(id, "buying $BTC", &["BTC"]))
                .await
                .unwrap();
            assert!(events.is_empty());
        }
        matcher
            .on_post("t1", &post("3", "$DOGE only", &["DOGE"]))
            .await
            .unwrap();

        assert!((matcher.velocity(&config, "$btc", None).unwrap() - 0.4).abs() < 1e-9);
        assert!((matcher.velocity(&config, "BTC", Some(10)).unwrap() - 0.2).abs() < 1e-9);
        assert_eq!(matcher.velocity(&config, "ETH", None).unwrap(), 0.0);
        assert_eq!(matcher.velocity(&config, "DOGE", None).unwrap(), 0.0);
    }

    #[tokio::test]
    async fn spike_at_threshold() {
        let matcher = CashtagMatcher::new();
        matcher
            .on_start(&tracker(json!({"symbols": ["BTC"], "spike_threshold": 0.4})))
            .await
            .unwrap();

        let first = matcher.on_post("t1", &post("1", "$BTC", &["BTC"])).await.unwrap();
        assert!(first.is_empty());
        let second = matcher.on_post("t1", &post("2", "$BTC", &["BTC"])).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].0, EventKind::VelocitySpike);
        assert_eq!(second[0].1["symbol"], "BTC");
        assert_eq!(second[0].1["mentions"], 2);
    }

    #[tokio::test]
    async fn spike_follows_base_event() {
        let h = Harness::new();
        let created = h
            .manager
            .create(
                "btc",
                TrackerType::Cashtag,
                json!({"symbols": ["BTC"], "spike_threshold": 0.2}),
            )
            .await
            .unwrap();
        let mut events = h.bus.subscribe(EventFilter::Tracker(created.id.clone()));
        h.manager.start(&created.id).await.unwrap();

        let tag = format!("tracker:{}", created.id);
        h.transport
            .push(feed_item_with_text("p1", "moon $BTC", &[&tag]))
            .await;

        assert_eq!(events.recv().await.unwrap().event_type, EventKind::NewTweet);
        let spike = events.recv().await.unwrap();
        assert_eq!(spike.event_type, EventKind::VelocitySpike);
        assert_eq!(spike.tracker_type, TrackerType::Cashtag);

        let velocity = h.manager.velocity(&created.id, "BTC", None).await.unwrap();
        assert!((velocity - 0.2).abs() < 1e-9);
    }
}
