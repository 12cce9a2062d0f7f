//! Alert-manager HTTP client.
//!
//! The pipeline uses the alert manager for three things: confirming an
//! alert is still firing before remediating (the freshness gate), expanding
//! aggregate incidents into their components, and acknowledging alerts once
//! a remediation ran. Authentication is a bearer token obtained at
//! construction and refreshed shortly before expiry by a background task.

pub mod client;


pub use client::AlertManager;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::{Duration, Instant};

pub const ALERT_PATH: &str = "/api/alerts";

/// Operations the pipeline consumes from the alert manager.
///
/// `get_alerts` and `post_ack` hit the wire; the polling combinators are
/// provided so every implementation (including test doubles) shares the
/// same loop semantics.
#[async_trait]
pub trait AlertManagerApi: Send + Sync {
    /// GETs `base + url_suffix` and decodes a JSON array of objects.
    async fn get_alerts(&self, url_suffix: &str)
        -> Result<Vec<serde_json::Map<String, serde_json::Value>>>;

    /// Acknowledges the alert upstream on behalf of the configured owner.
    async fn post_ack(&self, id: i64) -> Result<()>;

    /// Status of a single alert; errors when the alert is unknown.
    async fn get_status(&self, id: i64) -> Result<String> {
        let alerts = self
            .get_alerts(&format!("{ALERT_PATH}?id={id}"))
            .await
            .with_context(|| format!("failed to query alert {id}"))?;
        let first = alerts
            .first()
            .ok_or_else(|| anyhow!("no alerts returned for id {id}"))?;
        first
            .get("status")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("alert {id} has no status field"))
    }

    /// Polls every `interval` and returns true only if the alert held
    /// `desired` for the whole `duration`. Returns false the first time the
    /// status differs or a check fails.
    async fn assert_status(
        &self,
        desired: &str,
        id: i64,
        interval: Duration,
        duration: Duration,
    ) -> bool {
        let started = Instant::now();
        loop {
            let status = match self.get_status(id).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!(id, error = %e, "failed to check alert status");
                    return false;
                }
            };
            if status != desired {
                return false;
            }
            if started.elapsed() >= duration {
                return true;
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Polls every `interval` until the alert reaches `desired`; false at
    /// `timeout` or on a failed check.
    async fn wait_on_status(
        &self,
        desired: &str,
        id: i64,
        interval: Duration,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() >= deadline {
                return false;
            }
            match self.get_status(id).await {
                Ok(status) if status == desired => return true,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(id, error = %e, "failed to check alert status");
                    return false;
                }
            }
            tokio::time::sleep(interval).await;
        }
    }
}
