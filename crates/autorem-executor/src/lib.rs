//! Bounded-concurrency script execution.
//!
//! Remediation playbooks are external scripts invoked through a wrapper
//! (`runner.py`) in a configured scripts directory. Each command receives
//! the incident as JSON on stdin and reports through its exit code,
//! stdout (results) and stderr (logs).

pub mod script;


pub use script::ScriptExecutor;

use async_trait::async_trait;
use autorem_common::types::Incident;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wrapper script expected inside the scripts directory.
pub const RUNNER_SCRIPT: &str = "runner.py";

/// Per-command deadline when the rule does not set one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// One command of a playbook phase, as configured on a rule.
///
/// `name` is a human label and may repeat across a phase; `command` is the
/// script name handed to the wrapper. The incident is attached by the
/// pipeline before execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Deadline in seconds; zero means [`DEFAULT_TIMEOUT_SECS`].
    #[serde(default)]
    pub timeout: u64,
    /// `KEY=VALUE` pairs. Non-empty replaces the child environment
    /// entirely; empty inherits the parent's.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(skip)]
    pub input: Option<Incident>,
}

/// Outcome of a single command run.
///
/// `error` is set only when the command could not be run at all (spawn,
/// pipe or serialization failure). A non-zero exit is a failure reported
/// through `ret_code`, not an error.
#[derive(Debug, Clone, Default)]
pub struct CmdResult {
    pub ret_code: i32,
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub runtime: Duration,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.ret_code == 0 && self.error.is_none()
    }

    pub(crate) fn failed_to_run(message: String, runtime: Duration) -> CmdResult {
        CmdResult {
            ret_code: 0,
            error: Some(message),
            stdout: String::new(),
            stderr: String::new(),
            runtime,
        }
    }
}

/// Fan-out execution of a batch of commands with a concurrency cap.
///
/// Results are returned as `(Command, CmdResult)` pairs in completion
/// order, so duplicate command names never collide and a command that
/// failed to start keeps its identity.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, cmds: Vec<Command>, max_parallel: usize) -> Vec<(Command, CmdResult)>;
}
