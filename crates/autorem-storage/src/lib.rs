//! Relational persistence for remediations and their command runs.
//!
//! The schema is applied idempotently at connect time by the `migration`
//! crate. The backend is URL-driven: Postgres in production, SQLite in
//! tests.

pub mod entities;
pub mod error;
pub mod store;


pub use error::{Result, StorageError};
pub use store::SqlStore;

use async_trait::async_trait;
use autorem_common::types::{CommandRecord, Remediation};
use std::collections::HashMap;

/// Persistence operations the pipeline and the admin API consume.
///
/// Implementations must be safe to share across handler tasks; the
/// pipeline writes from many concurrent handlers while the HTTP surface
/// reads.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts a remediation and returns the generated id.
    async fn new_remediation(&self, rem: &Remediation) -> Result<i64>;

    /// Updates every mutable field of an existing remediation by id.
    async fn update_remediation(&self, rem: &Remediation) -> Result<()>;

    /// All remediation rows recorded for the given upstream incident id.
    async fn remediations_by_incident(&self, incident_id: i64) -> Result<Vec<Remediation>>;

    /// Remediation rows for the alert name whose entity set contains all
    /// of `entities`.
    async fn remediations_by_entity(
        &self,
        incident_name: &str,
        entities: &[String],
    ) -> Result<Vec<Remediation>>;

    /// Inserts a command record and returns the generated id.
    async fn new_command(&self, cmd: &CommandRecord) -> Result<i64>;

    /// Generic AND-equality filter over a table, for the HTTP read
    /// surface. Numeric-looking values compare as integers.
    async fn query(
        &self,
        table: &str,
        params: &HashMap<String, String>,
    ) -> Result<Vec<serde_json::Value>>;

    async fn close(&self) -> Result<()>;
}
