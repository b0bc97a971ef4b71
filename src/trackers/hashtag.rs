use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;
use crate::feed::rules::hashtag_term;
use crate::trackers::parse_params;
use crate::trackers::stream::StreamMatcher;
use crate::types::{TrackerConfig, TrackerType};

#[derive(Debug, Deserialize)]
struct HashtagParams {
    #[serde(default)]
    hashtags: Vec<String>,
}

/// Posts carrying any of the configured hashtags.
pub struct HashtagMatcher;

#[async_trait]
impl StreamMatcher for HashtagMatcher {
    fn tracker_type(&self) -> TrackerType {
        TrackerType::Hashtag
    }

    async fn terms(&self, tracker: &TrackerConfig) -> Result<Vec<String>> {
        let params: HashtagParams = parse_params(tracker)?;
        Ok(params.hashtags.iter().filter_map(|t| hashtag_term(t)).collect())
    }
}
