//! Task-tracker escalation.
//!
//! Every remediation attempt is mirrored into a ticket in an external
//! tracker: created lazily on the first attempt, then updated with command
//! output as attempts progress and the incident clears. The tracker is
//! behind the [`Escalator`] capability trait; the one concrete
//! implementation speaks the Jira issue API.

pub mod jira;

pub use jira::JiraEscalator;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Open,
    Closed,
    /// Any tracker state outside the open/closed allow-lists.
    Other,
}

/// A ticket in the external tracker.
///
/// `params` carries `project`, `description` and `comment` on create and
/// update calls; the tracker implementation decides what to do with them.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub created: DateTime<Utc>,
    pub params: HashMap<String, String>,
}

impl Task {
    pub fn with_id(id: &str) -> Task {
        Task {
            id: id.to_string(),
            title: String::new(),
            status: TaskStatus::Other,
            created: DateTime::<Utc>::MIN_UTC,
            params: HashMap::new(),
        }
    }
}

pub struct Tasks(pub Vec<Task>);

impl Tasks {
    /// The task with the greatest `created` timestamp, if any.
    pub fn latest(mut self) -> Option<Task> {
        self.0.sort_by(|a, b| b.created.cmp(&a.created));
        self.0.into_iter().next()
    }
}

/// Operations the pipeline performs against the tracker.
#[async_trait]
pub trait Escalator: Send + Sync {
    /// Creates a task. Requires a non-empty title; sets `task.id` and
    /// reloads the task on success.
    async fn create_task(&self, task: &mut Task) -> Result<()>;

    /// If `params["comment"]` is present, posts it as a comment; otherwise
    /// sends the remaining params as a field update.
    async fn update_task(&self, task: &Task) -> Result<()>;

    /// Fills in title, status and created for `task.id`.
    async fn load_task(&self, task: &mut Task) -> Result<()>;
}
