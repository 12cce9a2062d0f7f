//! Shared data model for the auto-remediation pipeline.
//!
//! Incidents arrive from the alerting platform over the message queue,
//! remediations and command records are what the pipeline persists about
//! handling them.

pub mod types;
