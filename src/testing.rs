//! Fakes and fixtures shared by the unit tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use crate::api::UpstreamApi;
use crate::bus::EventBus;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::feed::{FeedItem, FeedSignal, FeedTransport, ItemHandler, MatchedRule, RuleMultiplexer};
use crate::trackers::{Services, TrackerManager};
use crate::types::{MatchingRule, NewRule, Post, PostMetrics, TrendItem, UserProfile};

const WAIT_LIMIT: Duration = Duration::from_secs(3);
const WAIT_STEP: Duration = Duration::from_millis(5);

/// Poll `cond` until it holds; panics after a few seconds.
pub async fn wait_until(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(WAIT_STEP).await;
    }
}

/// Async flavour of [`wait_until`].
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(WAIT_STEP).await;
    }
}

// ── Fixtures ───────────────────────────────────────────────────────

pub fn profile(id: &str, username: &str) -> UserProfile {
    UserProfile {
        id: id.into(),
        username: username.into(),
        name: username.into(),
        ..UserProfile::default()
    }
}

pub fn post(id: &str, text: &str, cashtags: &[&str]) -> Post {
    Post {
        id: id.into(),
        author_id: Some("42".into()),
        author_username: None,
        text: text.into(),
        created_at: None,
        metrics: PostMetrics::default(),
        hashtags: vec![],
        cashtags: cashtags.iter().map(|s| s.to_string()).collect(),
        mentions: vec![],
    }
}

pub fn post_with_metrics(id: &str, likes: u64) -> Post {
    let mut p = post(id, "", &[]);
    p.metrics.likes = likes;
    p
}

pub fn feed_item(post_id: &str, tags: &[&str]) -> FeedItem {
    feed_item_with_text(post_id, &format!("post {post_id}"), tags)
}

pub fn feed_item_with_text(post_id: &str, text: &str, tags: &[&str]) -> FeedItem {
    FeedItem {
        data: json!({"id": post_id, "text": text, "author_id": "42"}),
        includes: serde_json::Value::Null,
        matching_rules: tags
            .iter()
            .enumerate()
            .map(|(i, tag)| MatchedRule {
                id: format!("r{i}"),
                tag: tag.to_string(),
            })
            .collect(),
    }
}

// ── Feed transport ─────────────────────────────────────────────────

/// In-process feed: rules live in a list, the connection is a channel the test drives.
#[derive(Default)]
pub struct FakeTransport {
    rules: Mutex<Vec<MatchingRule>>,
    next_id: AtomicU64,
    sender: Mutex<Option<mpsc::Sender<FeedSignal>>>,
    opens: AtomicUsize,
    attempts: AtomicUsize,
    failing_opens: AtomicBool,
    rejected: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn rules(&self) -> Vec<MatchingRule> {
        self.rules.lock().clone()
    }

    /// Simulate a rule deleted behind the multiplexer's back.
    pub fn remove_rule_externally(&self, id: &str) {
        self.rules.lock().retain(|r| r.id != id);
    }

    /// Successful connection opens.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Connection opens, failed or not.
    pub fn open_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Refuse to register rules with this value; the rest of a request still goes through.
    pub fn reject_rule(&self, value: &str) {
        self.rejected.lock().push(value.to_string());
    }

    pub fn fail_opens(&self, fail: bool) {
        self.failing_opens.store(fail, Ordering::SeqCst);
    }

    pub async fn push(&self, item: FeedItem) {
        let sender = self.sender.lock().clone();
        if let Some(tx) = sender {
            let _ = tx.send(FeedSignal::Item(item)).await;
        }
    }

    /// Close the current connection from the feed's side.
    pub async fn close(&self) {
        let sender = self.sender.lock().take();
        if let Some(tx) = sender {
            let _ = tx.send(FeedSignal::Closed).await;
        }
    }
}

#[async_trait]
impl FeedTransport for FakeTransport {
    async fn register_rules(&self, rules: &[NewRule]) -> Result<Vec<MatchingRule>> {
        let rejected = self.rejected.lock().clone();
        let created: Vec<MatchingRule> = rules
            .iter()
            .filter(|r| !rejected.contains(&r.value))
            .map(|r| MatchingRule {
                id: format!("rule-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
                value: r.value.clone(),
                tag: r.tag.clone(),
            })
            .collect();
        self.rules.lock().extend(created.iter().cloned());
        Ok(created)
    }

    /// Strict: unknown ids fail, like a feed that rejects the whole request.
    async fn unregister_rules(&self, ids: &[String]) -> Result<()> {
        let mut rules = self.rules.lock();
        if let Some(unknown) = ids.iter().find(|id| !rules.iter().any(|r| &r.id == *id)) {
            return Err(Error::transport(format!("unknown rule id {unknown}")));
        }
        rules.retain(|r| !ids.contains(&r.id));
        Ok(())
    }

    async fn list_rules(&self) -> Result<Vec<MatchingRule>> {
        Ok(self.rules())
    }

    async fn open_connection(&self) -> Result<mpsc::Receiver<FeedSignal>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing_opens.load(Ordering::SeqCst) {
            return Err(Error::transport("connection refused"));
        }
        let (tx, rx) = mpsc::channel(64);
        *self.sender.lock() = Some(tx);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn close_connection(&self) -> Result<()> {
        self.sender.lock().take();
        Ok(())
    }
}

// ── Item callbacks ─────────────────────────────────────────────────

#[derive(Default)]
enum Outcome {
    #[default]
    Succeed,
    Fail,
    Panic,
}

/// Records the post id of every item it receives.
#[derive(Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<String>>,
    outcome: Outcome,
}

impl RecordingHandler {
    pub fn failing() -> Self {
        Self {
            outcome: Outcome::Fail,
            ..Self::default()
        }
    }

    pub fn panicking() -> Self {
        Self {
            outcome: Outcome::Panic,
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ItemHandler for RecordingHandler {
    async fn handle(&self, item: Arc<FeedItem>) -> Result<()> {
        let id = item.data["id"].as_str().unwrap_or_default().to_string();
        self.seen.lock().push(id);
        match self.outcome {
            Outcome::Succeed => Ok(()),
            Outcome::Fail => Err(Error::transport("callback failed")),
            Outcome::Panic => panic!("callback panicked"),
        }
    }
}

// ── Upstream API ───────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeApi {
    users: Mutex<Vec<UserProfile>>,
    posts: Mutex<Vec<Post>>,
    timelines: Mutex<HashMap<String, Vec<Post>>>,
    trends: Mutex<Vec<TrendItem>>,
    failing: AtomicBool,
    trend_requests: Mutex<Vec<u32>>,
    post_requests: Mutex<Vec<String>>,
}

impl FakeApi {
    pub fn set_users(&self, users: Vec<UserProfile>) {
        *self.users.lock() = users;
    }

    pub fn set_posts(&self, posts: Vec<Post>) {
        *self.posts.lock() = posts;
    }

    pub fn set_timeline(&self, user_id: &str, posts: Vec<Post>) {
        self.timelines.lock().insert(user_id.to_string(), posts);
    }

    pub fn set_trends(&self, trends: Vec<TrendItem>) {
        *self.trends.lock() = trends;
    }

    /// Make every call fail with a 503.
    pub fn fail(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    pub fn trend_requests(&self) -> Vec<u32> {
        self.trend_requests.lock().clone()
    }

    /// Ids passed to the most recent `posts_by_ids` call.
    pub fn requested_post_ids(&self) -> Vec<String> {
        self.post_requests.lock().clone()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Upstream {
                status: 503,
                message: "service unavailable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl UpstreamApi for FakeApi {
    async fn users_by_ids(&self, ids: &[String]) -> Result<Vec<UserProfile>> {
        self.check()?;
        Ok(self
            .users
            .lock()
            .iter()
            .filter(|u| ids.contains(&u.id))
            .cloned()
            .collect())
    }

    async fn users_by_usernames(&self, usernames: &[String]) -> Result<Vec<UserProfile>> {
        self.check()?;
        Ok(self
            .users
            .lock()
            .iter()
            .filter(|u| usernames.iter().any(|n| n.eq_ignore_ascii_case(&u.username)))
            .cloned()
            .collect())
    }

    async fn posts_by_ids(&self, ids: &[String]) -> Result<Vec<Post>> {
        self.check()?;
        *self.post_requests.lock() = ids.to_vec();
        Ok(self
            .posts
            .lock()
            .iter()
            .filter(|p| ids.contains(&p.id))
            .cloned()
            .collect())
    }

    async fn posts_by_user(&self, user_id: &str, limit: usize) -> Result<Vec<Post>> {
        self.check()?;
        Ok(self
            .timelines
            .lock()
            .get(user_id)
            .map(|posts| posts.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn trends_by_region(&self, woeid: u32) -> Result<Vec<TrendItem>> {
        self.check()?;
        self.trend_requests.lock().push(woeid);
        Ok(self.trends.lock().clone())
    }
}

// ── Full wiring ────────────────────────────────────────────────────

/// A manager over in-memory stores, a fake API and a fake feed.
pub struct Harness {
    pub api: Arc<FakeApi>,
    pub transport: Arc<FakeTransport>,
    pub multiplexer: RuleMultiplexer,
    pub bus: EventBus,
    pub services: Services,
    pub manager: TrackerManager,
}

impl Harness {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.stream.reconnect_base_ms = 1;
        config.stream.reconnect_max_ms = 4;
        config.pacer.burst_threshold = u64::MAX;

        let api = Arc::new(FakeApi::default());
        let transport = Arc::new(FakeTransport::default());
        let multiplexer = RuleMultiplexer::new(transport.clone(), &config.stream);
        let bus = EventBus::new(256);
        let services = Services::in_memory(api.clone(), multiplexer.clone(), bus.clone());
        let manager = TrackerManager::new(services.clone(), &config);
        Self {
            api,
            transport,
            multiplexer,
            bus,
            services,
            manager,
        }
    }
}
