use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::feed::{FeedItem, FeedSignal};
use crate::types::{MatchingRule, NewRule};

/// Buffered signals between the socket reader and the multiplexer.
const SIGNAL_BUFFER: usize = 1024;

/// Connection and rule management for the upstream real-time feed.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Register rules; the feed assigns their ids. Rules the feed rejects are missing from
    /// the result.
    async fn register_rules(&self, rules: &[NewRule]) -> Result<Vec<MatchingRule>>;
    async fn unregister_rules(&self, ids: &[String]) -> Result<()>;
    async fn list_rules(&self) -> Result<Vec<MatchingRule>>;
    /// Open the live connection. Items, errors and closure arrive on the returned channel.
    async fn open_connection(&self) -> Result<mpsc::Receiver<FeedSignal>>;
    async fn close_connection(&self) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct RulesResponse {
    #[serde(default)]
    data: Vec<MatchingRule>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

/// Rules over HTTPS, matched items over a WebSocket.
pub struct WsFeedTransport {
    http: reqwest::Client,
    rules_url: String,
    stream_url: String,
    bearer_token: String,
    keepalive: Duration,
    session: Mutex<Option<CancellationToken>>,
}

impl WsFeedTransport {
    pub fn new(config: &StreamConfig, bearer_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            rules_url: config.rules_url.clone(),
            stream_url: config.stream_url.clone(),
            bearer_token: bearer_token.into(),
            keepalive: Duration::from_secs(config.keepalive_secs.max(1)),
            session: Mutex::new(None),
        }
    }

    async fn post_rules(&self, body: serde_json::Value) -> Result<RulesResponse> {
        let resp = self
            .http
            .post(&self.rules_url)
            .bearer_auth(&self.bearer_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::transport(format!("rules request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::transport(format!("rules endpoint returned {status}: {text}")));
        }
        resp.json::<RulesResponse>()
            .await
            .map_err(|e| Error::transport(format!("bad rules response: {e}")))
    }
}

#[async_trait]
impl FeedTransport for WsFeedTransport {
    async fn register_rules(&self, rules: &[NewRule]) -> Result<Vec<MatchingRule>> {
        if rules.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self.post_rules(json!({ "add": rules })).await?;
        if resp.data.len() < rules.len() {
            warn!(
                "Feed registered {} of {} rules: {}",
                resp.data.len(),
                rules.len(),
                serde_json::Value::from(resp.errors)
            );
        }
        debug!("Registered {} rule(s)", resp.data.len());
        Ok(resp.data)
    }

    async fn unregister_rules(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let resp = self
            .post_rules(json!({ "delete": { "ids": ids } }))
            .await?;
        if !resp.errors.is_empty() {
            warn!(
                "Feed reported errors deleting rules: {}",
                serde_json::Value::from(resp.errors)
            );
        }
        debug!("Unregistered {} rule(s)", ids.len());
        Ok(())
    }

    async fn list_rules(&self) -> Result<Vec<MatchingRule>> {
        let resp = self
            .http
            .get(&self.rules_url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| Error::transport(format!("rules request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::transport(format!("rules endpoint returned {status}")));
        }
        let body: RulesResponse = resp
            .json()
            .await
            .map_err(|e| Error::transport(format!("bad rules response: {e}")))?;
        Ok(body.data)
    }

    async fn open_connection(&self) -> Result<mpsc::Receiver<FeedSignal>> {
        let mut request = self
            .stream_url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::transport(format!("invalid stream url: {e}")))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.bearer_token))
            .map_err(|e| Error::transport(format!("invalid bearer token: {e}")))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws, response) = connect_async(request)
            .await
            .map_err(|e| Error::transport(format!("connect failed: {e}")))?;
        info!("Feed connected ({})", response.status());

        let token = CancellationToken::new();
        if let Some(previous) = self.session.lock().replace(token.clone()) {
            previous.cancel();
        }

        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let keepalive = self.keepalive;
        tokio::spawn(async move {
            let (mut write, mut read) = ws.split();
            let mut ping = tokio::time::interval(keepalive);
            ping.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    _ = ping.tick() => {
                        let _ = write.send(Message::Ping(Vec::new().into())).await;
                    }
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            let text = text.as_str().trim();
                            // Blank frames are heartbeats
                            if text.is_empty() {
                                continue;
                            }
                            let signal = match serde_json::from_str::<FeedItem>(text) {
                                Ok(item) => FeedSignal::Item(item),
                                Err(e) => FeedSignal::Error(format!("unparseable feed item: {e}")),
                            };
                            if tx.send(signal).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!("Feed closed by peer: {frame:?}");
                            let _ = tx.send(FeedSignal::Closed).await;
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = tx.send(FeedSignal::Error(e.to_string())).await;
                            let _ = tx.send(FeedSignal::Closed).await;
                            break;
                        }
                        None => {
                            let _ = tx.send(FeedSignal::Closed).await;
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn close_connection(&self) -> Result<()> {
        if let Some(token) = self.session.lock().take() {
            token.cancel();
            info!("Feed connection closed");
        }
        Ok(())
    }
}
