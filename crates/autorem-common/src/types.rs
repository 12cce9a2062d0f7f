use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// State change carried by an incident event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IncidentType {
    Active,
    Cleared,
    /// Any type the pipeline does not recognize; such incidents are ignored.
    #[serde(other)]
    Unknown,
}

/// An alert state-change event emitted by the alerting platform.
///
/// Incidents are ephemeral: they are decoded off the queue, drive one
/// handler run, and are never persisted directly. `data` carries
/// free-form context from the upstream alert, including the entity
/// identifiers the remediation is derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub name: String,
    #[serde(rename = "type")]
    pub incident_type: IncidentType,
    pub id: i64,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub is_aggregate: bool,
}

fn value_str(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Incident {
    /// Derives the entity list this incident refers to.
    ///
    /// An explicit `entities` list wins; otherwise a `device` key pairs
    /// with `entity` as `device:entity`; otherwise `entity` stands alone.
    pub fn entities(&self) -> Vec<String> {
        if let Some(serde_json::Value::Array(ents)) = self.data.get("entities") {
            return ents.iter().map(value_str).collect();
        }
        let entity = self
            .data
            .get("entity")
            .map(value_str)
            .unwrap_or_default();
        if let Some(device) = self.data.get("device") {
            return vec![format!("{}:{}", value_str(device), entity)];
        }
        vec![entity]
    }
}

/// Outcome of one remediation attempt, stored as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Active = 1,
    AuditFailed = 2,
    RemediationFailed = 3,
    RemediationSuccess = 4,
    OnclearFailed = 5,
    OnclearSuccess = 6,
    Error = 7,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Active,
        Status::AuditFailed,
        Status::RemediationFailed,
        Status::RemediationSuccess,
        Status::OnclearFailed,
        Status::OnclearSuccess,
        Status::Error,
    ];

    pub fn from_i16(v: i16) -> Option<Status> {
        Status::ALL.into_iter().find(|s| *s as i16 == v)
    }

    /// Failed statuses count against the rule's attempt budget.
    pub fn is_failed(&self) -> bool {
        matches!(self, Status::AuditFailed | Status::RemediationFailed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Active => "active",
            Status::AuditFailed => "audit_failed",
            Status::RemediationFailed => "remediation_failed",
            Status::RemediationSuccess => "remediation_success",
            Status::OnclearFailed => "onclear_failed",
            Status::OnclearSuccess => "onclear_success",
            Status::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|v| v.to_string() == s)
            .ok_or_else(|| format!("unknown status: {s}"))
    }
}

impl Serialize for Status {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i16(*self as i16)
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = i16::deserialize(deserializer)?;
        Status::from_i16(v)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid status code: {v}")))
    }
}

/// The persisted record of one attempted handling of one incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remediation {
    /// Database-assigned; zero until the row has been inserted.
    #[serde(default)]
    pub id: i64,
    pub incident_name: String,
    pub incident_id: i64,
    pub status: Status,
    pub entities: Vec<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub attempts: i32,
}

impl Remediation {
    pub fn from_incident(incident: &Incident) -> Remediation {
        Remediation {
            id: 0,
            incident_name: incident.name.clone(),
            incident_id: incident.id,
            status: Status::Active,
            entities: incident.entities(),
            start_time: Utc::now(),
            end_time: None,
            task_id: String::new(),
            attempts: 0,
        }
    }

    /// Moves the remediation to a terminal status and stamps `end_time`.
    pub fn end(&mut self, status: Status) {
        self.status = status;
        self.end_time = Some(Utc::now());
    }
}

/// Persisted output of a single command run within a remediation phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    #[serde(default)]
    pub id: i64,
    pub remediation_id: i64,
    pub command: String,
    pub retcode: i32,
    /// Wall-clock runtime in seconds.
    pub runtime: i64,
    /// Captured stderr.
    pub logs: String,
    /// Captured stdout, or the executor error string when the command
    /// could not be run at all.
    pub results: String,
}
