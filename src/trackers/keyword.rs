use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;
use crate::feed::rules::keyword_term;
use crate::trackers::parse_params;
use crate::trackers::stream::StreamMatcher;
use crate::types::{TrackerConfig, TrackerType};

#[derive(Debug, Deserialize)]
struct KeywordParams {
    #[serde(default)]
    keywords: Vec<String>,
}

/// Posts containing any configured keyword or exact phrase.
pub struct KeywordMatcher;

#[async_trait]
impl StreamMatcher for KeywordMatcher {
    fn tracker_type(&self) -> TrackerType {
        TrackerType::Keyword
    }

    async fn terms(&self, tracker: &TrackerConfig) -> Result<Vec<String>> {
        let params: KeywordParams = parse_params(tracker)?;
        Ok(params.keywords.iter().filter_map(|k| keyword_term(k)).collect())
    }
}
