//! Study search parameters

use chrono::{Days, NaiveDate};

use crate::config::{SourceConfig, MAX_PAGE_SIZE};
use crate::error::{PipelineError, Result};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parameters of one extraction. Besides the page size and the page token
/// these are passed through to the API unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyQuery {
    /// `query.term` expression
    pub term: Option<String>,
    /// Inclusive last-update window; either end may be open
    pub updated_from: Option<NaiveDate>,
    pub updated_to: Option<NaiveDate>,
    pub page_size: u32,
}

impl StudyQuery {
    pub fn new(page_size: u32) -> Self {
        Self {
            term: None,
            updated_from: None,
            updated_to: None,
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Build the query for a run on `today`. With `lookback_days` set only
    /// studies updated in the last N days are requested.
    pub fn from_config(config: &SourceConfig, today: NaiveDate) -> Result<Self> {
        let mut query = Self::new(config.page_size);
        query.term = config.query_term.clone().filter(|t| !t.trim().is_empty());
        if let Some(days) = config.lookback_days {
            let from = today.checked_sub_days(Days::new(u64::from(days))).ok_or_else(|| {
                PipelineError::Config(format!(
                    "source.lookback_days {} reaches before the earliest representable date",
                    days
                ))
            })?;
            query.updated_from = Some(from);
            query.updated_to = Some(today);
        }
        Ok(query)
    }

    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.term = Some(term.into());
        self
    }

    pub fn updated_between(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.updated_from = from;
        self.updated_to = to;
        self
    }

    /// `filter.advanced` expression for the last-update window
    pub fn advanced_filter(&self) -> Option<String> {
        if self.updated_from.is_none() && self.updated_to.is_none() {
            return None;
        }
        let bound = |d: Option<NaiveDate>, open: &str| {
            d.map(|d| d.format(DATE_FORMAT).to_string())
                .unwrap_or_else(|| open.to_string())
        };
        Some(format!(
            "AREA[LastUpdatePostDate]RANGE[{},{}]",
            bound(self.updated_from, "MIN"),
            bound(self.updated_to, "MAX")
        ))
    }

    /// Query-string pairs for one page request
    pub fn params(&self, page_token: Option<&str>) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("format", "json".to_string()),
            ("pageSize", self.page_size.to_string()),
        ];
        if let Some(term) = &self.term {
            params.push(("query.term", term.clone()));
        }
        if let Some(filter) = self.advanced_filter() {
            params.push(("filter.advanced", filter));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        params
    }
}
