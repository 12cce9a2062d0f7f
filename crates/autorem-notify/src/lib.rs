//! Chat notifications for remediation outcomes.
//!
//! Notifications are fire-and-forget: delivery failures are logged and
//! never influence the pipeline's result.

pub mod slack;

pub use slack::SlackNotifier;

use anyhow::Result;
use async_trait::async_trait;
use autorem_common::types::Remediation;

/// A short status message about a remediation, delivered out of band.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, rem: &Remediation, msg: &str) -> Result<()>;
}
