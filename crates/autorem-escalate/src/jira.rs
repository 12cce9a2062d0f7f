use crate::{Escalator, Task, TaskStatus};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

const LABEL: &str = "auto-remediated";
const ISSUE_TYPE: &str = "Task";

const OPEN_STATES: [&str; 2] = ["Open", "To Do"];
const CLOSED_STATES: [&str; 2] = ["Closed", "Done"];

pub(crate) fn map_status(name: &str) -> TaskStatus {
    if OPEN_STATES.contains(&name) {
        TaskStatus::Open
    } else if CLOSED_STATES.contains(&name) {
        TaskStatus::Closed
    } else {
        TaskStatus::Other
    }
}

/// Jira timestamps arrive as `2024-05-01T10:00:00.000+0000`; fall back to
/// RFC 3339 for servers that emit a colon in the offset.
pub(crate) fn parse_created(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.3f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("unparseable created timestamp: {raw}"))
}

pub(crate) fn issue_payload(title: &str, project: &str, description: &str) -> serde_json::Value {
    serde_json::json!({
        "fields": {
            "project": {"key": project},
            "summary": title,
            "description": description,
            "issuetype": {"name": ISSUE_TYPE},
            "labels": [LABEL],
        }
    })
}

#[derive(Deserialize)]
struct CreatedIssue {
    key: String,
}

#[derive(Deserialize)]
struct IssueFields {
    summary: Option<String>,
    status: Option<IssueStatus>,
    created: Option<String>,
}

#[derive(Deserialize)]
struct IssueStatus {
    name: String,
}

#[derive(Deserialize)]
struct Issue {
    fields: IssueFields,
}

/// Escalator over the Jira v2 issue REST API with basic auth.
pub struct JiraEscalator {
    base: String,
    project: String,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl JiraEscalator {
    pub fn new(url: &str, username: &str, password: &str, project: &str) -> Result<JiraEscalator> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build jira http client")?;
        Ok(JiraEscalator {
            base: url.trim_end_matches('/').to_string(),
            project: project.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            http,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base))
            .basic_auth(&self.username, Some(&self.password))
    }
}

#[async_trait]
impl Escalator for JiraEscalator {
    async fn create_task(&self, task: &mut Task) -> Result<()> {
        if task.title.is_empty() {
            return Err(anyhow!("create_task requires a title"));
        }
        let project = match task.params.get("project") {
            Some(p) if !p.is_empty() => p.as_str(),
            _ => self.project.as_str(),
        };
        let description = task.params.get("description").map(String::as_str).unwrap_or("");
        let payload = issue_payload(&task.title, project, description);

        let created: CreatedIssue = self
            .request(reqwest::Method::POST, "/rest/api/2/issue")
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("unable to decode created issue")?;
        task.id = created.key;
        self.load_task(task).await
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        if task.id.is_empty() {
            return Err(anyhow!("update_task requires a task id"));
        }
        if let Some(comment) = task.params.get("comment") {
            self.request(
                reqwest::Method::POST,
                &format!("/rest/api/2/issue/{}/comment", task.id),
            )
            .json(&serde_json::json!({"body": comment}))
            .send()
            .await?
            .error_for_status()?;
            return Ok(());
        }

        let mut fields = serde_json::Map::new();
        for key in ["summary", "description"] {
            if let Some(value) = task.params.get(key) {
                fields.insert(key.to_string(), serde_json::json!(value));
            }
        }
        if fields.is_empty() {
            return Ok(());
        }
        self.request(
            reqwest::Method::PUT,
            &format!("/rest/api/2/issue/{}", task.id),
        )
        .json(&serde_json::json!({"fields": fields}))
        .send()
        .await?
        .error_for_status()?;
        Ok(())
    }

    async fn load_task(&self, task: &mut Task) -> Result<()> {
        if task.id.is_empty() {
            return Err(anyhow!("load_task requires a task id"));
        }
        let issue: Issue = self
            .request(
                reqwest::Method::GET,
                &format!("/rest/api/2/issue/{}?fields=summary,status,created", task.id),
            )
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("unable to decode issue {}", task.id))?;

        if let Some(summary) = issue.fields.summary {
            task.title = summary;
        }
        task.status = issue
            .fields
            .status
            .map(|s| map_status(&s.name))
            .unwrap_or(TaskStatus::Other);
        if let Some(created) = issue.fields.created {
            task.created = parse_created(&created)?;
        }
        Ok(())
    }
}
