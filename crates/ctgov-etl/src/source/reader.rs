//! Page-token driven reader

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::client::StudySource;
use super::query::StudyQuery;
use crate::error::Result;
use crate::models::StudyRecord;

/// Walks a [`StudySource`] page by page.
///
/// Finite and not restartable. Reading stops when the source returns no
/// continuation token or `max_records` have been yielded, whichever comes
/// first. Pages are handed out as soon as they arrive so a failure on a
/// later page never discards records already returned.
pub struct PaginatedReader {
    source: Arc<dyn StudySource>,
    query: StudyQuery,
    max_records: Option<usize>,
    page_interval: Duration,
    next_token: Option<String>,
    pages: u32,
    records: usize,
    exhausted: bool,
}

impl PaginatedReader {
    pub fn new(source: Arc<dyn StudySource>, query: StudyQuery) -> Self {
        Self {
            source,
            query,
            max_records: None,
            page_interval: Duration::ZERO,
            next_token: None,
            pages: 0,
            records: 0,
            exhausted: false,
        }
    }

    pub fn with_max_records(mut self, max_records: Option<usize>) -> Self {
        self.max_records = max_records;
        self
    }

    /// Delay between consecutive page requests
    pub fn with_page_interval(mut self, interval: Duration) -> Self {
        self.page_interval = interval;
        self
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages
    }

    pub fn records_read(&self) -> usize {
        self.records
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Next page of records, or `None` once the source is exhausted
    pub async fn next_page(&mut self) -> Result<Option<Vec<StudyRecord>>> {
        if self.exhausted {
            return Ok(None);
        }
        if self.max_records.is_some_and(|max| self.records >= max) {
            self.exhausted = true;
            return Ok(None);
        }
        if self.pages > 0 && !self.page_interval.is_zero() {
            tokio::time::sleep(self.page_interval).await;
        }

        let page = self
            .source
            .fetch(&self.query, self.next_token.as_deref())
            .await?;
        self.pages += 1;

        let mut records = page.records;
        if let Some(max) = self.max_records {
            let remaining = max.saturating_sub(self.records);
            if records.len() >= remaining {
                records.truncate(remaining);
                self.exhausted = true;
                info!(max_records = max, "Record limit reached");
            }
        }
        self.records += records.len();

        match page.next_page_token {
            Some(token) if self.next_token.as_deref() == Some(token.as_str()) => {
                warn!(token = %token, "Source repeated its page token, stopping");
                self.exhausted = true;
            },
            Some(token) => self.next_token = Some(token),
            None => self.exhausted = true,
        }

        info!(
            page = self.pages,
            records = records.len(),
            total = self.records,
            "Read page"
        );
        Ok(Some(records))
    }
}
