//! Run notifications

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::info;

use crate::config::NotifyConfig;
use crate::pipeline::RunReport;

/// Receives the report of every successful run. Failures are logged by the
/// caller and never fail the run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, report: &RunReport) -> Result<()>;
}

/// POSTs the run report as JSON
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// `None` when no webhook is configured
    pub fn from_config(config: &NotifyConfig) -> Result<Option<Self>> {
        config
            .webhook_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .map(|url| Self::new(url, Duration::from_secs(config.timeout_secs)))
            .transpose()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, report: &RunReport) -> Result<()> {
        self.client
            .post(&self.url)
            .json(report)
            .send()
            .await
            .context("Failed to send run notification")?
            .error_for_status()
            .context("Webhook rejected run notification")?;

        info!(batch_id = %report.batch_id, "Run notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_webhook_configured() {
        assert!(WebhookNotifier::from_config(&NotifyConfig::default())
            .unwrap()
            .is_none());
        let blank = NotifyConfig {
            webhook_url: Some(" ".to_string()),
            ..NotifyConfig::default()
        };
        assert!(WebhookNotifier::from_config(&blank).unwrap().is_none());
    }

    #[test]
    fn test_webhook_configured() {
        let config = NotifyConfig {
            webhook_url: Some("http://localhost:9/hook".to_string()),
            ..NotifyConfig::default()
        };
        assert!(WebhookNotifier::from_config(&config).unwrap().is_some());
    }
}
