//! Lifecycle shared by the feed-based strategies.
//!
//! A running stream tracker owns a set of matching rules tagged `tracker:<id>` and one
//! callback on the multiplexer for that tag. The strategy-specific part is a
//! [`StreamMatcher`]: which rule terms to register and what extra events a post triggers.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::extract;
use crate::feed::rules::{build_rule_values, rule_tag};
use crate::feed::{FeedItem, ItemHandler, RuleMultiplexer};
use crate::store::{PostStore, TrackerStore};
use crate::trackers::{TrackerStrategy, load_tracker};
use crate::types::{EventKind, NewRule, Post, TrackerConfig, TrackerEvent, TrackerStatus, TrackerType};

#[async_trait]
pub trait StreamMatcher: Send + Sync + 'static {
    fn tracker_type(&self) -> TrackerType;

    /// Rule terms for the tracker. An empty list means nothing to track.
    async fn terms(&self, tracker: &TrackerConfig) -> Result<Vec<String>>;

    /// Called after the terms are known, before any rule is registered.
    async fn on_start(&self, _tracker: &TrackerConfig) -> Result<()> {
        Ok(())
    }

    /// Follow-up events for a post, published after its `new_tweet` event.
    async fn on_post(&self, _tracker_id: &str, _post: &Post) -> Result<Vec<(EventKind, Value)>> {
        Ok(Vec::new())
    }
}

/// Shared collaborators of every stream strategy.
#[derive(Clone)]
pub struct StreamDeps {
    pub trackers: Arc<dyn TrackerStore>,
    pub posts: Arc<dyn PostStore>,
    pub multiplexer: RuleMultiplexer,
    pub bus: EventBus,
    pub max_rule_length: usize,
}

pub struct StreamingTracker<M> {
    matcher: Arc<M>,
    deps: StreamDeps,
    running: Mutex<HashSet<String>>,
}

impl<M: StreamMatcher> StreamingTracker<M> {
    pub fn new(matcher: M, deps: StreamDeps) -> Self {
        Self {
            matcher: Arc::new(matcher),
            deps,
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn matcher(&self) -> &M {
        &self.matcher
    }

    /// Persist the rules, attach the callback and bring the feed up.
    async fn activate(&self, id: &str, tag: &str, rule_ids: &BTreeSet<String>) -> Result<()> {
        self.deps.trackers.set_rule_ids(id, rule_ids.clone()).await?;
        self.deps
            .trackers
            .set_status(id, TrackerStatus::Active, None)
            .await?;

        let handler = StreamHandler {
            tracker_id: id.to_string(),
            tag: tag.to_string(),
            matcher: Arc::clone(&self.matcher),
            deps: self.deps.clone(),
        };
        self.deps.multiplexer.on_item(tag, Arc::new(handler));
        self.deps.multiplexer.connect().await
    }

    /// Undo a half-finished start. Rules that can't be removed stay persisted so the next
    /// start clears them as stale.
    async fn roll_back(&self, id: &str, tag: &str, rule_ids: &BTreeSet<String>) {
        self.deps.multiplexer.off_item(tag);
        let ids: Vec<String> = rule_ids.iter().cloned().collect();
        if let Err(e) = self.deps.multiplexer.remove_rules(&ids).await {
            warn!("[{id}] Failed to remove rules of failed start: {e}");
            if let Err(e) = self.deps.trackers.set_rule_ids(id, rule_ids.clone()).await {
                warn!("[{id}] {} rule(s) left unowned upstream: {e}", ids.len());
            }
            return;
        }
        if let Err(e) = self.deps.trackers.set_rule_ids(id, BTreeSet::new()).await {
            warn!("[{id}] Failed to clear rule ids: {e}");
        }
    }

    async fn remove_stale_rules(&self, tracker: &TrackerConfig) {
        if tracker.rule_ids.is_empty() {
            return;
        }
        let stale: Vec<String> = tracker.rule_ids.iter().cloned().collect();
        match self.deps.multiplexer.remove_rules(&stale).await {
            Ok(n) => debug!("[{}] Removed {n} stale rule(s)", tracker.id),
            Err(e) => warn!("[{}] Failed to remove stale rules: {e}", tracker.id),
        }
    }
}

#[async_trait]
impl<M: StreamMatcher> TrackerStrategy for StreamingTracker<M> {
    fn tracker_type(&self) -> TrackerType {
        self.matcher.tracker_type()
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.contains(id) {
            if self.deps.multiplexer.is_connected() {
                debug!("[{id}] Already running");
                return Ok(());
            }
            self.deps.multiplexer.connect().await?;
            self.deps
                .trackers
                .set_status(id, TrackerStatus::Active, None)
                .await?;
            info!("[{id}] Feed reconnected for running tracker");
            return Ok(());
        }

        let tracker = load_tracker(self.deps.trackers.as_ref(), id, self.tracker_type()).await?;
        let terms = self.matcher.terms(&tracker).await?;
        if terms.is_empty() {
            return Err(Error::NoTargets(id.to_string()));
        }
        self.matcher.on_start(&tracker).await?;

        // Rule calls fail until a failed reconnect is recovered.
        if self.deps.multiplexer.has_failed().await {
            self.deps.multiplexer.connect().await?;
        }
        self.remove_stale_rules(&tracker).await;

        let tag = rule_tag(id);
        let rules: Vec<NewRule> = build_rule_values(&terms, self.deps.max_rule_length)
            .into_iter()
            .map(|value| NewRule {
                value,
                tag: tag.clone(),
            })
            .collect();
        let created = self.deps.multiplexer.add_rules(rules).await?;
        let rule_ids: BTreeSet<String> = created.into_iter().map(|r| r.id).collect();
        info!(
            "[{id}] {} tracker registered {} rule(s) for {} term(s)",
            self.tracker_type(),
            rule_ids.len(),
            terms.len()
        );

        if let Err(e) = self.activate(id, &tag, &rule_ids).await {
            warn!("[{id}] Start failed after registering rules: {e}");
            self.roll_back(id, &tag, &rule_ids).await;
            return Err(e);
        }
        running.insert(id.to_string());
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let mut running = self.running.lock().await;
        if !running.remove(id) {
            debug!("[{id}] Not running");
            return Ok(());
        }

        let rule_ids: Vec<String> = self
            .deps
            .trackers
            .get(id)
            .await?
            .map(|t| t.rule_ids.into_iter().collect())
            .unwrap_or_default();
        if let Err(e) = self.deps.multiplexer.remove_rules(&rule_ids).await {
            running.insert(id.to_string());
            return Err(e);
        }
        self.deps.multiplexer.off_item(&rule_tag(id));

        self.deps.trackers.set_rule_ids(id, BTreeSet::new()).await?;
        self.deps
            .trackers
            .set_status(id, TrackerStatus::Paused, None)
            .await?;
        info!("[{id}] {} tracker stopped", self.tracker_type());
        Ok(())
    }

    async fn is_running(&self, id: &str) -> bool {
        self.running.lock().await.contains(id)
    }

    /// Detach callbacks without touching persisted status or rules, so the trackers resume
    /// on the next start.
    async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        for id in running.drain() {
            self.deps.multiplexer.off_item(&rule_tag(&id));
        }
    }
}

struct StreamHandler<M> {
    tracker_id: String,
    tag: String,
    matcher: Arc<M>,
    deps: StreamDeps,
}

impl<M> StreamHandler<M> {
    fn publish(&self, tracker_type: TrackerType, kind: EventKind, data: Value) {
        self.deps
            .bus
            .publish(TrackerEvent::new(&self.tracker_id, tracker_type, kind, data));
    }
}

#[async_trait]
impl<M: StreamMatcher> ItemHandler for StreamHandler<M> {
    async fn handle(&self, item: Arc<FeedItem>) -> Result<()> {
        let post = extract::post_from_feed_item(&item)?;
        let (record, created) = self
            .deps
            .posts
            .upsert_match(post.clone(), &self.tracker_id, &self.tag)
            .await?;
        self.deps.trackers.record_run(&self.tracker_id, Utc::now()).await?;

        let tracker_type = self.matcher.tracker_type();
        self.publish(
            tracker_type,
            EventKind::NewTweet,
            json!({
                "post": post,
                "matched_tracker_ids": record.matched_tracker_ids,
                "first_seen": created,
            }),
        );

        for (kind, data) in self.matcher.on_post(&self.tracker_id, &post).await? {
            self.publish(tracker_type, kind, data);
        }
        Ok(())
    }
}
