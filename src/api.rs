use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{ApiConfig, PacerConfig};
use crate::error::{Error, Result};
use crate::extract::{self, WirePost, WireTrend, WireUser};
use crate::pacer::Pacer;
use crate::types::{Post, TrendItem, UserProfile};

/// Base delay for retrying non-rate-limit transient failures (doubles each attempt).
const BASE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// The platform rejects `max_results` below this on timeline reads.
const MIN_TIMELINE_PAGE: usize = 5;

const USER_FIELDS: &str =
    "description,location,url,profile_image_url,verified,protected,public_metrics";
const POST_FIELDS: &str = "author_id,created_at,public_metrics,entities";

/// Read operations the trackers need from the upstream platform.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn users_by_ids(&self, ids: &[String]) -> Result<Vec<UserProfile>>;
    async fn users_by_usernames(&self, usernames: &[String]) -> Result<Vec<UserProfile>>;
    async fn posts_by_ids(&self, ids: &[String]) -> Result<Vec<Post>>;
    /// Most recent posts of one account, newest first.
    async fn posts_by_user(&self, user_id: &str, limit: usize) -> Result<Vec<Post>>;
    /// Current trends for a region (Yahoo WOEID).
    async fn trends_by_region(&self, woeid: u32) -> Result<Vec<TrendItem>>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    includes: Includes,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<WireUser>,
}

/// reqwest-backed client for the platform's v2 REST API.
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    bearer_token: String,
    max_retries: u32,
    batch_size: usize,
    pacer: Mutex<Pacer>,
}

impl HttpApi {
    pub fn new(config: &ApiConfig, pacer: PacerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token.clone(),
            max_retries: config.max_retries.max(1),
            batch_size: config.batch_size.clamp(1, 100),
            pacer: Mutex::new(Pacer::new(pacer)),
        })
    }

    /// GET a JSON resource with retry for transient errors.
    ///
    /// HTTP 429 escalates the shared pacer backoff; other transient failures use a short
    /// exponential delay. A success resets the backoff.
    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let mut attempt: u32 = 0;

        loop {
            let sent = self
                .client
                .get(&url)
                .bearer_auth(&self.bearer_token)
                .query(query)
                .send()
                .await;

            let err = match sent {
                Ok(resp) if resp.status().is_success() => {
                    self.pacer.lock().await.reset_backoff();
                    return Ok(resp.json::<T>().await?);
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    Error::Upstream {
                        status,
                        message: truncate(&body, 300),
                    }
                }
                Err(e) => Error::Http(e),
            };

            attempt += 1;
            if !err.is_transient() || attempt >= self.max_retries {
                return Err(err);
            }

            let delay = if matches!(err, Error::Upstream { status: 429, .. }) {
                self.pacer.lock().await.backoff()
            } else {
                BASE_RETRY_DELAY * 2u32.pow(attempt - 1)
            };
            warn!(
                "Transient error on {path} (attempt {attempt}/{}): {err}; retrying in {delay:?}",
                self.max_retries
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn pace(&self) {
        let delay = self.pacer.lock().await.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn lookup_users(&self, path: &str, key: &str, values: &[String]) -> Result<Vec<UserProfile>> {
        let mut all = Vec::with_capacity(values.len());
        for chunk in values.chunks(self.batch_size) {
            let query = [
                (key, chunk.join(",")),
                ("user.fields", USER_FIELDS.to_string()),
            ];
            let page: Envelope<Vec<WireUser>> = self.get_json(path, &query).await?;
            all.extend(
                page.data
                    .unwrap_or_default()
                    .into_iter()
                    .map(extract::profile_from_wire),
            );
            self.pace().await;
        }
        debug!("Fetched {} of {} users via {path}", all.len(), values.len());
        Ok(all)
    }
}

#[async_trait]
impl UpstreamApi for HttpApi {
    async fn users_by_ids(&self, ids: &[String]) -> Result<Vec<UserProfile>> {
        self.lookup_users("users", "ids", ids).await
    }

    async fn users_by_usernames(&self, usernames: &[String]) -> Result<Vec<UserProfile>> {
        let cleaned: Vec<String> = usernames
            .iter()
            .map(|u| u.trim().trim_start_matches('@').to_string())
            .filter(|u| !u.is_empty())
            .collect();
        self.lookup_users("users/by", "usernames", &cleaned).await
    }

    async fn posts_by_ids(&self, ids: &[String]) -> Result<Vec<Post>> {
        let mut all = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.batch_size) {
            let query = [
                ("ids", chunk.join(",")),
                ("tweet.fields", POST_FIELDS.to_string()),
                ("expansions", "author_id".to_string()),
            ];
            let page: Envelope<Vec<WirePost>> = self.get_json("tweets", &query).await?;
            let users = page.includes.users;
            all.extend(
                page.data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|p| extract::post_from_wire(p, &users)),
            );
            self.pace().await;
        }
        debug!("Fetched {} of {} posts", all.len(), ids.len());
        Ok(all)
    }

    async fn posts_by_user(&self, user_id: &str, limit: usize) -> Result<Vec<Post>> {
        let page_size = limit.clamp(MIN_TIMELINE_PAGE, 100);
        let query = [
            ("max_results", page_size.to_string()),
            ("tweet.fields", POST_FIELDS.to_string()),
            ("expansions", "author_id".to_string()),
        ];
        let page: Envelope<Vec<WirePost>> = self
            .get_json(&format!("users/{user_id}/tweets"), &query)
            .await?;
        let users = page.includes.users;
        let posts: Vec<Post> = page
            .data
            .unwrap_or_default()
            .into_iter()
            .take(limit)
            .map(|p| extract::post_from_wire(p, &users))
            .collect();
        debug!("Fetched {} recent posts for user {user_id}", posts.len());
        Ok(posts)
    }

    async fn trends_by_region(&self, woeid: u32) -> Result<Vec<TrendItem>> {
        let page: Envelope<Vec<WireTrend>> = self
            .get_json(&format!("trends/by/woeid/{woeid}"), &[])
            .await?;
        let trends: Vec<TrendItem> = page
            .data
            .unwrap_or_default()
            .into_iter()
            .map(extract::trend_from_wire)
            .collect();
        debug!("Fetched {} trends for woeid {woeid}", trends.len());
        Ok(trends)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
