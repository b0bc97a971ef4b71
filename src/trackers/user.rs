use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::api::UpstreamApi;
use crate::error::Result;
use crate::feed::rules::from_term;
use crate::trackers::stream::StreamMatcher;
use crate::trackers::{clean_usernames, parse_params};
use crate::types::{TrackerConfig, TrackerType};

#[derive(Debug, Deserialize)]
struct UserParams {
    #[serde(default)]
    usernames: Vec<String>,
}

/// Posts authored by the configured accounts.
///
/// Rules match on account ids, so usernames are resolved when the tracker starts.
pub struct UserMatcher {
    api: Arc<dyn UpstreamApi>,
}

impl UserMatcher {
    pub fn new(api: Arc<dyn UpstreamApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl StreamMatcher for UserMatcher {
    fn tracker_type(&self) -> TrackerType {
        TrackerType::User
    }

    async fn terms(&self, tracker: &TrackerConfig) -> Result<Vec<String>> {
        let params: UserParams = parse_params(tracker)?;
        let usernames = clean_usernames(&params.usernames);
        if usernames.is_empty() {
            return Ok(Vec::new());
        }

        let users = self.api.users_by_usernames(&usernames).await?;
        for name in &usernames {
            if !users.iter().any(|u| u.username.eq_ignore_ascii_case(name)) {
                warn!("[{}] Unknown account @{name}; skipped", tracker.id);
            }
        }
        Ok(users.iter().map(|u| from_term(&u.id)).collect())
    }
}
