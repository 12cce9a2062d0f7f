use crate::Notifier;
use anyhow::{Context, Result};
use async_trait::async_trait;
use autorem_common::types::Remediation;
use std::time::Duration;

/// Posts remediation status messages to a Slack incoming webhook.
pub struct SlackNotifier {
    url: String,
    channel: String,
    mention: String,
    http: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(url: &str, channel: &str, mention: &str) -> Result<SlackNotifier> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .context("failed to build slack http client")?;
        Ok(SlackNotifier {
            url: url.to_string(),
            channel: channel.to_string(),
            mention: mention.to_string(),
            http,
        })
    }
}

pub(crate) fn build_payload(
    rem: &Remediation,
    msg: &str,
    channel: &str,
    mention: &str,
) -> serde_json::Value {
    let message = if mention.is_empty() {
        msg.to_string()
    } else {
        format!("{mention} {msg}")
    };
    let mut body = serde_json::json!({
        "attachments": [{
            "title": "Auto Remediator",
            "text": message,
            "fields": [
                {"title": "RemediationID", "value": rem.id, "short": false},
                {"title": "IncidentID", "value": rem.incident_id, "short": false},
                {"title": "IncidentName", "value": rem.incident_name, "short": false},
            ],
            "footer": "via Auto Remediator",
            "ts": rem.start_time.timestamp(),
        }],
        // Linkify urls, users and channels in the alert message.
        "parse": "full",
    });
    if !channel.is_empty() {
        body["channel"] = serde_json::json!(channel);
    }
    body
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, rem: &Remediation, msg: &str) -> Result<()> {
        let body = build_payload(rem, msg, &self.channel, &self.mention);
        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("unable to post to slack")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            tracing::error!(%status, body = %text, "unable to post to slack");
        }
        Ok(())
    }
}
