//! HTTP client for the registry's v2 API

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use super::query::StudyQuery;
use crate::config::SourceConfig;
use crate::error::{PipelineError, Result};
use crate::models::StudyRecord;

pub const USER_AGENT: &str = concat!("ctgov-etl/", env!("CARGO_PKG_VERSION"));

/// One page of flattened studies
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StudyPage {
    pub records: Vec<StudyRecord>,
    /// `None` when the source is exhausted
    pub next_page_token: Option<String>,
}

/// A paginated source of studies.
///
/// Implementations fail fast: any transport error or non-2xx answer is
/// [`PipelineError::SourceUnavailable`] and is not retried.
#[async_trait]
pub trait StudySource: Send + Sync {
    async fn fetch(&self, query: &StudyQuery, page_token: Option<&str>) -> Result<StudyPage>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StudiesResponse {
    #[serde(default)]
    studies: Vec<Value>,
    next_page_token: Option<String>,
}

pub struct ClinicalTrialsClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl ClinicalTrialsClient {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| PipelineError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn studies_url(&self) -> String {
        format!("{}/studies", self.base_url)
    }
}

#[async_trait]
impl StudySource for ClinicalTrialsClient {
    #[instrument(skip(self, query))]
    async fn fetch(&self, query: &StudyQuery, page_token: Option<&str>) -> Result<StudyPage> {
        let url = self.studies_url();

        let mut request = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&query.params(page_token));
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::SourceUnavailable(format!("GET {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::SourceUnavailable(format!(
                "GET {} returned {}",
                url, status
            )));
        }

        let body: StudiesResponse = response.json().await.map_err(|e| {
            PipelineError::SourceUnavailable(format!("GET {}: invalid response body: {}", url, e))
        })?;

        let extracted_at = Utc::now();
        let records: Vec<StudyRecord> = body
            .studies
            .iter()
            .map(|study| StudyRecord::from_study(study, extracted_at))
            .collect();
        let next_page_token = body.next_page_token.filter(|t| !t.is_empty());

        debug!(
            records = records.len(),
            has_more = next_page_token.is_some(),
            "Fetched page"
        );

        Ok(StudyPage {
            records,
            next_page_token,
        })
    }
}
