//! Single live feed connection shared by every stream tracker.
//!
//! Items are routed by the tags in their `matching_rules` annotations. Each tag owns a queue
//! drained by its own task, so callbacks for one tag run sequentially while a slow callback
//! never stalls the socket reader or other tags.
//!
//! Connection changes and rule mutations are serialized on one async lock. A closed
//! connection is reconnected with backoff up to `max_reconnect_attempts`; exhausting them
//! leaves a failure that every rule operation returns as [`Error::Transport`] until a
//! `connect()` succeeds.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{PacerConfig, StreamConfig};
use crate::error::{Error, Result};
use crate::feed::{FeedItem, FeedSignal, FeedTransport};
use crate::pacer::Pacer;
use crate::types::{MatchingRule, NewRule};

/// Callback invoked for every item carrying a given tag.
#[async_trait]
pub trait ItemHandler: Send + Sync {
    async fn handle(&self, item: Arc<FeedItem>) -> Result<()>;
}

type Handlers = Arc<RwLock<Vec<Arc<dyn ItemHandler>>>>;

struct Route {
    handlers: Handlers,
    queue: mpsc::UnboundedSender<Arc<FeedItem>>,
}

#[derive(Default)]
struct ConnState {
    /// Set when reconnection gave up; cleared by the next successful connect.
    failure: Option<String>,
}

struct Inner {
    transport: Arc<dyn FeedTransport>,
    routes: RwLock<HashMap<String, Route>>,
    conn: tokio::sync::Mutex<ConnState>,
    reader: Mutex<Option<CancellationToken>>,
    connected: AtomicBool,
    max_reconnect_attempts: u32,
    reconnect: PacerConfig,
}

#[derive(Clone)]
pub struct RuleMultiplexer {
    inner: Arc<Inner>,
}

impl RuleMultiplexer {
    pub fn new(transport: Arc<dyn FeedTransport>, config: &StreamConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                routes: RwLock::new(HashMap::new()),
                conn: tokio::sync::Mutex::new(ConnState::default()),
                reader: Mutex::new(None),
                connected: AtomicBool::new(false),
                max_reconnect_attempts: config.max_reconnect_attempts,
                reconnect: config.reconnect_pacer(),
            }),
        }
    }

    /// Register rules with the feed, returning them with their assigned ids.
    ///
    /// All or nothing: when the feed rejects any rule, the ones it accepted are removed again
    /// and the call fails.
    pub async fn add_rules(&self, rules: Vec<NewRule>) -> Result<Vec<MatchingRule>> {
        let conn = self.inner.conn.lock().await;
        check_failure(&conn)?;
        let created = self.inner.transport.register_rules(&rules).await?;
        if created.len() < rules.len() {
            let ids: Vec<String> = created.iter().map(|r| r.id.clone()).collect();
            if !ids.is_empty() {
                if let Err(e) = self.inner.transport.unregister_rules(&ids).await {
                    warn!("Failed to roll back {} partially added rule(s): {e}", ids.len());
                }
            }
            return Err(Error::transport(format!(
                "feed accepted {} of {} rule(s)",
                created.len(),
                rules.len()
            )));
        }
        info!("Added {} rule(s)", created.len());
        Ok(created)
    }

    /// Remove the given rules. Ids the feed no longer knows are skipped.
    ///
    /// Returns how many rules were actually removed.
    pub async fn remove_rules(&self, ids: &[String]) -> Result<usize> {
        let conn = self.inner.conn.lock().await;
        check_failure(&conn)?;
        if ids.is_empty() {
            return Ok(0);
        }

        let registered = self.inner.transport.list_rules().await?;
        let present: Vec<String> = ids
            .iter()
            .filter(|id| registered.iter().any(|r| &r.id == *id))
            .cloned()
            .collect();
        if present.len() < ids.len() {
            debug!(
                "{} of {} rule id(s) already gone upstream",
                ids.len() - present.len(),
                ids.len()
            );
        }
        if present.is_empty() {
            return Ok(0);
        }

        self.inner.transport.unregister_rules(&present).await?;
        info!("Removed {} rule(s)", present.len());
        Ok(present.len())
    }

    pub async fn get_rules(&self) -> Result<Vec<MatchingRule>> {
        let conn = self.inner.conn.lock().await;
        check_failure(&conn)?;
        self.inner.transport.list_rules().await
    }

    /// Open the live connection. Calling it while connected is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let mut conn = self.inner.conn.lock().await;
        if self.is_connected() {
            warn!("Feed already connected");
            return Ok(());
        }

        let signals = self.inner.transport.open_connection().await?;
        if conn.failure.take().is_some() {
            info!("Feed recovered from failed reconnect");
        }
        let token = CancellationToken::new();
        if let Some(previous) = self.inner.reader.lock().replace(token.clone()) {
            previous.cancel();
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        tokio::spawn(read_loop(Arc::clone(&self.inner), signals, token));
        info!("Feed multiplexer connected");
        Ok(())
    }

    /// Close the live connection. Registered callbacks stay in place.
    pub async fn disconnect(&self) -> Result<()> {
        // Cancel first: a reconnect in progress holds the connection lock.
        if let Some(token) = self.inner.reader.lock().take() {
            token.cancel();
        }
        let _conn = self.inner.conn.lock().await;
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.transport.close_connection().await?;
        info!("Feed multiplexer disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Whether reconnection gave up and no connect has succeeded since.
    pub async fn has_failed(&self) -> bool {
        self.inner.conn.lock().await.failure.is_some()
    }

    /// Register a callback for items matching `tag`.
    pub fn on_item(&self, tag: &str, handler: Arc<dyn ItemHandler>) {
        let mut routes = self.inner.routes.write();
        if let Some(route) = routes.get(tag) {
            route.handlers.write().push(handler);
            return;
        }

        let handlers: Handlers = Arc::new(RwLock::new(vec![handler]));
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(route_worker(tag.to_string(), Arc::clone(&handlers), rx));
        routes.insert(tag.to_string(), Route { handlers, queue });
        debug!(tag, "Item route registered");
    }

    /// Drop every callback registered for `tag`. Returns whether any existed.
    pub fn off_item(&self, tag: &str) -> bool {
        let removed = self.inner.routes.write().remove(tag).is_some();
        if removed {
            debug!(tag, "Item route removed");
        }
        removed
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.inner.routes.read().keys().cloned().collect();
        tags.sort();
        tags
    }
}

fn check_failure(conn: &ConnState) -> Result<()> {
    match &conn.failure {
        Some(msg) => Err(Error::Transport(msg.clone())),
        None => Ok(()),
    }
}

impl Inner {
    fn dispatch(&self, item: FeedItem) {
        let item = Arc::new(item);
        let tags = item.tags();
        if tags.is_empty() {
            debug!("Feed item without rule annotations dropped");
            return;
        }

        let routes = self.routes.read();
        for tag in tags {
            match routes.get(tag) {
                Some(route) => {
                    if route.queue.send(Arc::clone(&item)).is_err() {
                        warn!(tag, "Item route closed; item dropped");
                    }
                }
                None => debug!(tag, "No callback registered for tag"),
            }
        }
    }

    /// Reopen the connection after it closed. `None` when cancelled or exhausted.
    async fn reconnect(&self, token: &CancellationToken) -> Option<mpsc::Receiver<FeedSignal>> {
        let mut conn = self.conn.lock().await;
        if token.is_cancelled() {
            return None;
        }

        let mut pacer = Pacer::new(self.reconnect.clone());
        for attempt in 1..=self.max_reconnect_attempts {
            let delay = pacer.backoff();
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.transport.open_connection().await {
                Ok(signals) => {
                    self.connected.store(true, Ordering::SeqCst);
                    info!("Feed reconnected (attempt {attempt})");
                    return Some(signals);
                }
                Err(e) => warn!(
                    "Feed reconnect attempt {attempt}/{} failed: {e}",
                    self.max_reconnect_attempts
                ),
            }
        }

        let msg = format!(
            "feed reconnect failed after {} attempt(s)",
            self.max_reconnect_attempts
        );
        error!("{msg}");
        conn.failure = Some(msg);
        self.reader.lock().take();
        None
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    mut signals: mpsc::Receiver<FeedSignal>,
    token: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            signal = signals.recv() => signal,
        };

        match signal {
            Some(FeedSignal::Item(item)) => inner.dispatch(item),
            Some(FeedSignal::Error(e)) => warn!("Feed transport error: {e}"),
            Some(FeedSignal::Closed) | None => {
                inner.connected.store(false, Ordering::SeqCst);
                if token.is_cancelled() {
                    return;
                }
                warn!("Feed connection closed; reconnecting");
                match inner.reconnect(&token).await {
                    Some(next) => signals = next,
                    None => return,
                }
            }
        }
    }
}

/// Deliver a tag's items to its callbacks one at a time.
async fn route_worker(tag: String, handlers: Handlers, mut queue: mpsc::UnboundedReceiver<Arc<FeedItem>>) {
    while let Some(item) = queue.recv().await {
        let current: Vec<Arc<dyn ItemHandler>> = handlers.read().clone();
        for handler in current {
            match AssertUnwindSafe(handler.handle(Arc::clone(&item)))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(tag = %tag, "Item callback failed: {e}"),
                Err(_) => error!(tag = %tag, "Item callback panicked"),
            }
        }
    }
    debug!(tag = %tag, "Item route drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransport, RecordingHandler, feed_item, wait_until};

    fn config(max_reconnect_attempts: u32) -> StreamConfig {
        StreamConfig {
            max_reconnect_attempts,
            reconnect_base_ms: 1,
            reconnect_max_ms: 4,
            ..StreamConfig::default()
        }
    }

    fn setup(max_reconnect_attempts: u32) -> (Arc<FakeTransport>, RuleMultiplexer) {
        let transport = Arc::new(FakeTransport::default());
        let mux = RuleMultiplexer::new(transport.clone(), &config(max_reconnect_attempts));
        (transport, mux)
    }

    fn rule(value: &str, tag: &str) -> NewRule {
        NewRule {
            value: value.into(),
            tag: tag.into(),
        }
    }

    #[tokio::test]
    async fn registered_rule_round_trips() {
        let (_transport, mux) = setup(3);
        let created = mux.add_rules(vec![rule("#rust", "tracker:t1")]).await.unwrap();
        assert_eq!(created.len(), 1);
        assert!(!created[0].id.is_empty());

        let rules = mux.get_rules().await.unwrap();
        assert!(rules
            .iter()
            .any(|r| r.value == "#rust" && r.tag == "tracker:t1" && r.id == created[0].id));
    }

    #[tokio::test]
    async fn partially_rejected_registration_leaves_no_rules() {
        let (transport, mux) = setup(3);
        transport.reject_rule("#bad");
        let err = mux
            .add_rules(vec![
                rule("#a", "tracker:t1"),
                rule("#bad", "tracker:t1"),
                rule("#b", "tracker:t1"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(transport.rules().is_empty());
        assert!(mux.get_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_skips_rules_already_gone() {
        let (transport, mux) = setup(3);
        let created = mux
            .add_rules(vec![rule("#a", "tracker:t1"), rule("#b", "tracker:t1")])
            .await
            .unwrap();
        transport.remove_rule_externally(&created[0].id);

        let ids: Vec<String> = created.iter().map(|r| r.id.clone()).collect();
        assert_eq!(mux.remove_rules(&ids).await.unwrap(), 1);
        assert_eq!(mux.remove_rules(&ids).await.unwrap(), 0);
        assert!(mux.get_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (transport, mux) = setup(3);
        mux.connect().await.unwrap();
        mux.connect().await.unwrap();
        assert!(mux.is_connected());
        assert_eq!(transport.open_count(), 1);

        mux.disconnect().await.unwrap();
        assert!(!mux.is_connected());
    }

    #[tokio::test]
    async fn routes_item_to_every_matched_tag() {
        let (transport, mux) = setup(3);
        let a = Arc::new(RecordingHandler::default());
        let b = Arc::new(RecordingHandler::default());
        let c = Arc::new(RecordingHandler::default());
        mux.on_item("tracker:a", a.clone());
        mux.on_item("tracker:b", b.clone());
        mux.on_item("tracker:c", c.clone());
        mux.connect().await.unwrap();

        transport.push(feed_item("p1", &["tracker:a", "tracker:b"])).await;
        wait_until(|| a.count() == 1 && b.count() == 1).await;
        assert_eq!(c.count(), 0);
        assert_eq!(a.seen(), vec!["p1"]);
    }

    #[tokio::test]
    async fn failing_callback_does_not_block_others() {
        let (transport, mux) = setup(3);
        let failing = Arc::new(RecordingHandler::failing());
        let panicking = Arc::new(RecordingHandler::panicking());
        let healthy = Arc::new(RecordingHandler::default());
        mux.on_item("tracker:a", failing.clone());
        mux.on_item("tracker:a", panicking.clone());
        mux.on_item("tracker:a", healthy.clone());
        mux.connect().await.unwrap();

        transport.push(feed_item("p1", &["tracker:a"])).await;
        transport.push(feed_item("p2", &["tracker:a"])).await;
        wait_until(|| healthy.count() == 2).await;
        assert_eq!(failing.count(), 2);
        assert_eq!(healthy.seen(), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn off_item_stops_delivery() {
        let (transport, mux) = setup(3);
        let a = Arc::new(RecordingHandler::default());
        let b = Arc::new(RecordingHandler::default());
        mux.on_item("tracker:a", a.clone());
        mux.on_item("tracker:b", b.clone());
        mux.connect().await.unwrap();

        assert!(mux.off_item("tracker:a"));
        assert!(!mux.off_item("tracker:a"));
        assert_eq!(mux.tags(), vec!["tracker:b"]);

        transport.push(feed_item("p1", &["tracker:a", "tracker:b"])).await;
        wait_until(|| b.count() == 1).await;
        assert_eq!(a.count(), 0);
    }

    #[tokio::test]
    async fn closed_connection_reconnects() {
        let (transport, mux) = setup(3);
        let a = Arc::new(RecordingHandler::default());
        mux.on_item("tracker:a", a.clone());
        mux.connect().await.unwrap();

        transport.close().await;
        wait_until(|| transport.open_count() == 2).await;
        wait_until(|| mux.is_connected()).await;

        transport.push(feed_item("p1", &["tracker:a"])).await;
        wait_until(|| a.count() == 1).await;
    }

    #[tokio::test]
    async fn exhausted_reconnect_fails_every_caller_until_connect() {
        let (transport, mux) = setup(2);
        mux.add_rules(vec![rule("#a", "tracker:t1")]).await.unwrap();
        mux.connect().await.unwrap();

        transport.fail_opens(true);
        transport.close().await;
        wait_until(|| transport.open_attempts() == 3).await;

        // The failure is recorded under the connection lock before the next call can run.
        let err = loop {
            match mux.get_rules().await {
                Err(e) => break e,
                Ok(_) => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
            }
        };
        assert!(matches!(err, Error::Transport(_)));
        assert!(!mux.is_connected());
        assert!(mux.has_failed().await);

        let other = mux.clone();
        let (listed, added) = tokio::join!(
            tokio::spawn(async move { other.get_rules().await }),
            mux.add_rules(vec![rule("#b", "tracker:t2")]),
        );
        assert!(matches!(listed.unwrap(), Err(Error::Transport(_))));
        assert!(matches!(added, Err(Error::Transport(_))));
        assert!(matches!(mux.remove_rules(&["rule-1".to_string()]).await, Err(Error::Transport(_))));

        // connect retries the connection instead of replaying the failure
        assert!(matches!(mux.connect().await, Err(Error::Transport(_))));
        assert!(mux.has_failed().await);
        transport.fail_opens(false);
        mux.connect().await.unwrap();
        assert!(mux.is_connected());
        assert!(!mux.has_failed().await);
        assert_eq!(mux.get_rules().await.unwrap().len(), 1);
    }
}
