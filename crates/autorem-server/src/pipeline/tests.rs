use crate::config::{Config, ConfigHandler, Rule};
use crate::pipeline::Remediator;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use autorem_alertmgr::AlertManagerApi;
use autorem_common::types::{CommandRecord, Incident, IncidentType, Remediation, Status};
use autorem_escalate::{Escalator, Task, TaskStatus};
use autorem_executor::{CmdResult, Command, Executor};
use autorem_notify::Notifier;
use autorem_storage::{StorageError, Store};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

// ---- doubles ----

#[derive(Default)]
struct MockExecutor {
    executed: Mutex<Vec<String>>,
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute(&self, cmds: Vec<Command>, _max_parallel: usize) -> Vec<(Command, CmdResult)> {
        cmds.into_iter()
            .map(|cmd| {
                self.executed.lock().unwrap().push(cmd.name.clone());
                let result = match cmd.name.as_str() {
                    "audit1" | "rem1" | "onclear1" => CmdResult {
                        ret_code: 0,
                        stdout: format!("{} passed", cmd.name),
                        stderr: "log line".to_string(),
                        ..CmdResult::default()
                    },
                    "audit2" | "rem2" => CmdResult {
                        ret_code: 1,
                        stderr: "failed check".to_string(),
                        ..CmdResult::default()
                    },
                    "err1" => CmdResult {
                        error: Some("no such script".to_string()),
                        ..CmdResult::default()
                    },
                    _ => CmdResult::default(),
                };
                (cmd, result)
            })
            .collect()
    }
}

/// Executor that holds the phase open long enough for shutdown tests.
struct SlowExecutor;

#[async_trait]
impl Executor for SlowExecutor {
    async fn execute(&self, cmds: Vec<Command>, _max_parallel: usize) -> Vec<(Command, CmdResult)> {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        cmds.into_iter().map(|c| (c, CmdResult::default())).collect()
    }
}

#[derive(Default)]
struct StoreState {
    rems: Vec<Remediation>,
    cmds: Vec<CommandRecord>,
    next_rem_id: i64,
    next_cmd_id: i64,
    closed: bool,
}

struct MockStore {
    state: Mutex<StoreState>,
}

impl MockStore {
    fn new() -> MockStore {
        MockStore {
            state: Mutex::new(StoreState {
                next_rem_id: 1,
                next_cmd_id: 1,
                ..StoreState::default()
            }),
        }
    }

    fn seed(&self, rem: Remediation) {
        self.state.lock().unwrap().rems.push(rem);
    }

    fn remediations(&self) -> Vec<Remediation> {
        self.state.lock().unwrap().rems.clone()
    }

    fn commands(&self) -> Vec<CommandRecord> {
        self.state.lock().unwrap().cmds.clone()
    }

    fn closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[async_trait]
impl Store for MockStore {
    async fn new_remediation(&self, rem: &Remediation) -> autorem_storage::Result<i64> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_rem_id;
        state.next_rem_id += 1;
        let mut rem = rem.clone();
        rem.id = id;
        state.rems.push(rem);
        Ok(id)
    }

    async fn update_remediation(&self, rem: &Remediation) -> autorem_storage::Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.rems.iter_mut().find(|r| r.id == rem.id) {
            Some(slot) => {
                *slot = rem.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound {
                entity: "remediation",
                id: rem.id,
            }),
        }
    }

    async fn remediations_by_incident(
        &self,
        incident_id: i64,
    ) -> autorem_storage::Result<Vec<Remediation>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .rems
            .iter()
            .filter(|r| r.incident_id == incident_id)
            .cloned()
            .collect())
    }

    async fn remediations_by_entity(
        &self,
        incident_name: &str,
        entities: &[String],
    ) -> autorem_storage::Result<Vec<Remediation>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .rems
            .iter()
            .filter(|r| {
                r.incident_name == incident_name
                    && entities.iter().all(|e| r.entities.contains(e))
            })
            .cloned()
            .collect())
    }

    async fn new_command(&self, cmd: &CommandRecord) -> autorem_storage::Result<i64> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_cmd_id;
        state.next_cmd_id += 1;
        let mut cmd = cmd.clone();
        cmd.id = id;
        state.cmds.push(cmd);
        Ok(id)
    }

    async fn query(
        &self,
        _table: &str,
        _params: &HashMap<String, String>,
    ) -> autorem_storage::Result<Vec<serde_json::Value>> {
        Ok(vec![])
    }

    async fn close(&self) -> autorem_storage::Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

#[derive(Default)]
struct MockAm {
    statuses: Mutex<HashMap<i64, &'static str>>,
    acks: Mutex<Vec<i64>>,
    calls: Mutex<Vec<String>>,
}

impl MockAm {
    fn set_status(&self, id: i64, status: &'static str) {
        self.statuses.lock().unwrap().insert(id, status);
    }

    fn acks(&self) -> Vec<i64> {
        self.acks.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertManagerApi for MockAm {
    async fn get_alerts(
        &self,
        url_suffix: &str,
    ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
        self.calls.lock().unwrap().push(url_suffix.to_string());
        if url_suffix.contains("agg_id") {
            let components = serde_json::json!([
                {"alert": 40, "device": "d2", "entity": "e2"},
                {"alert": 50, "device": "d3", "entity": "e3"},
            ]);
            return Ok(serde_json::from_value(components).unwrap());
        }
        let id: i64 = url_suffix
            .rsplit('=')
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| anyhow!("bad suffix: {url_suffix}"))?;
        let status = self
            .statuses
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .unwrap_or("ACTIVE");
        let alert = serde_json::json!([{"status": status}]);
        Ok(serde_json::from_value(alert).unwrap())
    }

    async fn post_ack(&self, id: i64) -> Result<()> {
        self.acks.lock().unwrap().push(id);
        Ok(())
    }
}

#[derive(Default)]
struct MockEscalator {
    /// task id -> (status, created)
    tasks: Mutex<HashMap<String, (TaskStatus, DateTime<Utc>)>>,
    created: Mutex<Vec<String>>,
    updates: Mutex<Vec<(String, HashMap<String, String>)>>,
}

impl MockEscalator {
    fn seed_task(&self, id: &str, status: TaskStatus, created: DateTime<Utc>) {
        self.tasks
            .lock()
            .unwrap()
            .insert(id.to_string(), (status, created));
    }

    fn created_titles(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    fn updates(&self) -> Vec<(String, HashMap<String, String>)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl Escalator for MockEscalator {
    async fn create_task(&self, task: &mut Task) -> Result<()> {
        assert!(!task.title.is_empty(), "create_task requires a title");
        let id = format!("TASK-{}", self.tasks.lock().unwrap().len() + 1);
        let now = Utc::now();
        self.tasks
            .lock()
            .unwrap()
            .insert(id.clone(), (TaskStatus::Open, now));
        self.created.lock().unwrap().push(task.title.clone());
        task.id = id;
        task.status = TaskStatus::Open;
        task.created = now;
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        self.updates
            .lock()
            .unwrap()
            .push((task.id.clone(), task.params.clone()));
        Ok(())
    }

    async fn load_task(&self, task: &mut Task) -> Result<()> {
        let tasks = self.tasks.lock().unwrap();
        let (status, created) = tasks
            .get(&task.id)
            .ok_or_else(|| anyhow!("task {} not found", task.id))?;
        task.status = *status;
        task.created = *created;
        Ok(())
    }
}

#[derive(Default)]
struct MockNotifier {
    msgs: Mutex<Vec<String>>,
}

impl MockNotifier {
    fn messages(&self) -> Vec<String> {
        self.msgs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send(&self, _rem: &Remediation, msg: &str) -> Result<()> {
        self.msgs.lock().unwrap().push(msg.to_string());
        Ok(())
    }
}

// ---- harness ----

fn cmd(name: &str, script: &str) -> Command {
    Command {
        name: name.to_string(),
        command: script.to_string(),
        args: vec!["arg1".to_string(), "arg2".to_string()],
        ..Command::default()
    }
}

fn rules() -> Vec<Rule> {
    let audits_pass = vec![cmd("audit1", "cmd1")];
    let audits_fail = vec![cmd("audit2", "cmd2")];
    let audits_err = vec![cmd("err1", "cmd_missing")];
    let rems_pass = vec![cmd("rem1", "cmd1")];
    let rems_fail = vec![cmd("rem2", "cmd2")];
    let on_clear = vec![cmd("onclear1", "cmd3")];

    vec![
        Rule {
            alert_name: "Test1".into(),
            enabled: true,
            attempts: 2,
            audits: audits_pass.clone(),
            remediations: rems_pass.clone(),
            ..Rule::default()
        },
        Rule {
            alert_name: "Test2".into(),
            enabled: false,
            ..Rule::default()
        },
        Rule {
            alert_name: "Test3".into(),
            enabled: true,
            attempts: 2,
            audits: audits_fail,
            remediations: rems_pass.clone(),
            ..Rule::default()
        },
        Rule {
            alert_name: "Test4".into(),
            enabled: true,
            attempts: 2,
            audits: audits_pass.clone(),
            remediations: rems_fail,
            ..Rule::default()
        },
        Rule {
            alert_name: "Test5".into(),
            enabled: true,
            attempts: 3,
            audits: audits_pass.clone(),
            remediations: rems_pass.clone(),
            ..Rule::default()
        },
        Rule {
            alert_name: "Test6".into(),
            enabled: true,
            attempts: 2,
            audits: audits_err,
            ..Rule::default()
        },
        Rule {
            alert_name: "TestClear".into(),
            enabled: true,
            attempts: 2,
            audits: audits_pass.clone(),
            remediations: rems_pass.clone(),
            on_clear,
            ..Rule::default()
        },
        Rule {
            alert_name: "TestNoEsc".into(),
            enabled: true,
            attempts: 2,
            dont_escalate: true,
            audits: audits_pass,
            remediations: rems_pass,
            ..Rule::default()
        },
    ]
}

struct Harness {
    remediator: Arc<Remediator>,
    store: Arc<MockStore>,
    am: Arc<MockAm>,
    exec: Arc<MockExecutor>,
    esc: Arc<MockEscalator>,
    notif: Arc<MockNotifier>,
    incident_tx: mpsc::Sender<Incident>,
}

fn harness() -> Harness {
    let store = Arc::new(MockStore::new());
    let am = Arc::new(MockAm::default());
    let exec = Arc::new(MockExecutor::default());
    let esc = Arc::new(MockEscalator::default());
    let notif = Arc::new(MockNotifier::default());
    let (incident_tx, rx) = mpsc::channel(1);

    let config = ConfigHandler {
        config: Config {
            incident_timeout: 300,
            alert_check_interval: 0,
            jira_project: "NET".to_string(),
            ..Config::default()
        },
        rules: rules(),
    };

    let remediator = Remediator::assemble(
        Arc::new(config),
        None,
        exec.clone(),
        store.clone(),
        am.clone(),
        Some(notif.clone()),
        Some(esc.clone()),
        rx,
    );
    Harness {
        remediator,
        store,
        am,
        exec,
        esc,
        notif,
        incident_tx,
    }
}

fn incident(name: &str, id: i64, incident_type: IncidentType) -> Incident {
    let mut data = HashMap::new();
    data.insert("description".to_string(), serde_json::json!("dummy"));
    data.insert("device".to_string(), serde_json::json!("d1"));
    data.insert("entity".to_string(), serde_json::json!("e1"));
    Incident {
        name: name.to_string(),
        incident_type,
        id,
        start_time: Utc::now(),
        data,
        added_at: Utc::now(),
        is_aggregate: false,
    }
}

fn seed_rem(
    id: i64,
    name: &str,
    incident_id: i64,
    status: Status,
    attempts: i32,
    task_id: &str,
) -> Remediation {
    Remediation {
        id,
        incident_name: name.to_string(),
        incident_id,
        status,
        entities: vec!["d1:e1".to_string()],
        start_time: Utc::now(),
        end_time: if status == Status::Active {
            None
        } else {
            Some(Utc::now())
        },
        task_id: task_id.to_string(),
        attempts,
    }
}

// ---- active-path scenarios ----

#[tokio::test]
async fn unknown_and_disabled_rules_are_dropped() {
    let h = harness();
    let rem = h
        .remediator
        .process_incident(incident("NoSuchRule", 1, IncidentType::Active))
        .await;
    assert!(rem.is_none());

    let rem = h
        .remediator
        .process_incident(incident("Test2", 2, IncidentType::Active))
        .await;
    assert!(rem.is_none());
    assert!(h.store.remediations().is_empty());
}

#[tokio::test]
async fn freshness_gate_rejects_inactive_alert() {
    let h = harness();
    h.am.set_status(10, "CLEARED");
    let rem = h
        .remediator
        .process_incident(incident("Test1", 10, IncidentType::Active))
        .await;
    assert!(rem.is_none());
    // No remediation row may exist after a failed gate.
    assert!(h.store.remediations().is_empty());
    assert!(h.am.acks().is_empty());
}

#[tokio::test]
async fn happy_path_runs_both_phases() {
    let h = harness();
    let rem = h
        .remediator
        .process_incident(incident("Test1", 11, IncidentType::Active))
        .await
        .unwrap();

    assert_eq!(rem.status, Status::RemediationSuccess);
    assert_eq!(rem.attempts, 1);
    assert_eq!(rem.entities, vec!["d1:e1"]);
    assert!(rem.end_time.is_some());

    let rows = h.store.remediations();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, Status::RemediationSuccess);
    assert_eq!(rows[0].attempts, 1);
    assert_eq!(h.store.commands().len(), 2);
    assert!(h
        .store
        .commands()
        .iter()
        .all(|c| c.remediation_id == rem.id));

    assert_eq!(h.am.acks(), vec![11]);
    assert_eq!(h.notif.messages(), vec!["Remediation Successful"]);
    assert_eq!(h.esc.created_titles(), vec!["Incident: 11:Test1"]);

    // Output lands as the ticket description on the attempt that created it.
    let updates = h.esc.updates();
    assert_eq!(updates.len(), 1);
    let params = &updates[0].1;
    assert!(params["description"].contains("cmd1 Output"));
}

#[tokio::test]
async fn audit_failure_stops_the_handler() {
    let h = harness();
    let rem = h
        .remediator
        .process_incident(incident("Test3", 20, IncidentType::Active))
        .await
        .unwrap();

    assert_eq!(rem.status, Status::AuditFailed);
    assert!(rem.end_time.is_some());
    // The remediation phase never ran.
    assert_eq!(*h.exec.executed.lock().unwrap(), vec!["audit2"]);
    assert_eq!(h.store.commands().len(), 1);
    // Audit failures do not ack the upstream alert.
    assert!(h.am.acks().is_empty());
    assert_eq!(
        h.notif.messages(),
        vec!["Audit run failed, not running remediations"]
    );
    // But the ticket still receives the audit output.
    let updates = h.esc.updates();
    assert_eq!(updates.len(), 1);
    assert!(updates[0].1["description"].contains("cmd2 Output"));
}

#[tokio::test]
async fn remediation_failure_is_recorded_and_acked() {
    let h = harness();
    let rem = h
        .remediator
        .process_incident(incident("Test4", 21, IncidentType::Active))
        .await
        .unwrap();

    assert_eq!(rem.status, Status::RemediationFailed);
    assert_eq!(h.am.acks(), vec![21]);
    assert_eq!(h.notif.messages(), vec!["Remediation run failed"]);
}

#[tokio::test]
async fn executor_error_marks_remediation_errored() {
    let h = harness();
    let rem = h
        .remediator
        .process_incident(incident("Test6", 22, IncidentType::Active))
        .await
        .unwrap();

    assert_eq!(rem.status, Status::Error);
    let cmds = h.store.commands();
    assert_eq!(cmds.len(), 1);
    assert!(cmds[0].results.contains("Failed to run cmd err1"));
}

#[tokio::test]
async fn retry_budget_reuses_the_prior_row() {
    let h = harness();
    h.store.seed(seed_rem(
        100,
        "Test5",
        44,
        Status::RemediationFailed,
        2,
        "NET-100",
    ));
    h.esc.seed_task("NET-100", TaskStatus::Open, Utc::now());

    let rem = h
        .remediator
        .process_incident(incident("Test5", 44, IncidentType::Active))
        .await
        .unwrap();

    assert_eq!(rem.id, 100);
    assert_eq!(rem.attempts, 3);
    assert_eq!(rem.status, Status::RemediationSuccess);

    let rows = h.store.remediations();
    assert_eq!(rows.len(), 1, "the prior row is updated, not duplicated");
    assert_eq!(rows[0].attempts, 3);
    // The existing ticket is reused and commented, not recreated.
    assert!(h.esc.created_titles().is_empty());
    let updates = h.esc.updates();
    assert_eq!(updates.len(), 1);
    assert!(updates[0].1.contains_key("comment"));
}

#[tokio::test]
async fn exhausted_attempts_short_circuit() {
    let h = harness();
    h.store
        .seed(seed_rem(200, "Test5", 55, Status::AuditFailed, 3, "NET-200"));
    h.esc.seed_task("NET-200", TaskStatus::Open, Utc::now());

    let rem = h
        .remediator
        .process_incident(incident("Test5", 55, IncidentType::Active))
        .await
        .unwrap();

    assert_eq!(rem.id, 200);
    assert_eq!(rem.status, Status::AuditFailed);
    assert_eq!(rem.attempts, 3);
    // No phase ran; the alert was acked and the row left untouched.
    assert!(h.exec.executed.lock().unwrap().is_empty());
    assert_eq!(h.am.acks(), vec![55]);
    assert_eq!(h.store.remediations()[0].attempts, 3);
}

#[tokio::test]
async fn closed_tasks_do_not_count_as_current() {
    let h = harness();
    h.store
        .seed(seed_rem(300, "Test1", 66, Status::AuditFailed, 2, "NET-300"));
    h.store
        .seed(seed_rem(301, "Test1", 66, Status::AuditFailed, 2, "NET-301"));
    h.esc.seed_task("NET-300", TaskStatus::Closed, Utc::now());
    h.esc.seed_task("NET-301", TaskStatus::Closed, Utc::now());

    let rem = h
        .remediator
        .process_incident(incident("Test1", 66, IncidentType::Active))
        .await
        .unwrap();

    // All prior tasks are closed, so a fresh attempt starts.
    assert!(rem.id > 0 && rem.id != 300 && rem.id != 301);
    assert_eq!(rem.attempts, 1);
    assert_eq!(h.store.remediations().len(), 3);
}

#[tokio::test]
async fn dedup_picks_the_latest_open_task() {
    let h = harness();
    let mut older = seed_rem(310, "Test5", 77, Status::RemediationFailed, 1, "NET-310");
    older.start_time = Utc::now();
    h.store.seed(older);
    let mut newer_task = seed_rem(311, "Test5", 77, Status::RemediationFailed, 1, "NET-311");
    newer_task.start_time = Utc::now() - chrono::Duration::hours(2);
    h.store.seed(newer_task);

    h.esc.seed_task(
        "NET-310",
        TaskStatus::Open,
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    );
    h.esc.seed_task(
        "NET-311",
        TaskStatus::Open,
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
    );

    let rem = h
        .remediator
        .process_incident(incident("Test5", 77, IncidentType::Active))
        .await
        .unwrap();

    // Task creation time, not remediation start time, decides the current
    // attempt.
    assert_eq!(rem.id, 311);
}

#[tokio::test]
async fn aggregate_incident_expands_components() {
    let h = harness();
    let mut inc = incident("Test1", 30, IncidentType::Active);
    inc.is_aggregate = true;

    let rem = h.remediator.process_incident(inc).await.unwrap();

    assert_eq!(rem.entities, vec!["d2:e2", "d3:e3"]);
    assert_eq!(rem.status, Status::RemediationSuccess);
    let calls = h.am.calls.lock().unwrap().clone();
    assert!(calls.iter().any(|c| c.contains("agg_id=30")));
}

#[tokio::test]
async fn dont_escalate_suppresses_the_tracker() {
    let h = harness();
    let rem = h
        .remediator
        .process_incident(incident("TestNoEsc", 92, IncidentType::Active))
        .await
        .unwrap();

    assert_eq!(rem.status, Status::RemediationSuccess);
    assert!(rem.task_id.is_empty());
    assert!(h.esc.created_titles().is_empty());
    assert!(h.esc.updates().is_empty());
}

// ---- cleared-path scenarios ----

#[tokio::test]
async fn cleared_without_prior_success_skips_onclear() {
    let h = harness();
    h.store.seed(seed_rem(
        400,
        "TestClear",
        88,
        Status::RemediationFailed,
        1,
        "NET-400",
    ));
    h.esc.seed_task("NET-400", TaskStatus::Open, Utc::now());

    let rem = h
        .remediator
        .process_incident(incident("TestClear", 88, IncidentType::Cleared))
        .await
        .unwrap();

    assert_eq!(rem.id, 400);
    assert_eq!(rem.status, Status::RemediationFailed);
    assert!(h.exec.executed.lock().unwrap().is_empty());
    assert!(h.notif.messages().is_empty());
    // The ticket is still told about the clear.
    let updates = h.esc.updates();
    assert_eq!(updates.len(), 1);
    assert!(updates[0].1["comment"].contains("This incident has now CLEARED"));
}

#[tokio::test]
async fn cleared_after_success_runs_onclear() {
    let h = harness();
    h.store.seed(seed_rem(
        401,
        "TestClear",
        89,
        Status::RemediationSuccess,
        1,
        "NET-401",
    ));
    h.esc.seed_task("NET-401", TaskStatus::Open, Utc::now());

    let rem = h
        .remediator
        .process_incident(incident("TestClear", 89, IncidentType::Cleared))
        .await
        .unwrap();

    assert_eq!(rem.status, Status::OnclearSuccess);
    assert_eq!(*h.exec.executed.lock().unwrap(), vec!["onclear1"]);
    assert_eq!(h.notif.messages(), vec!["Incident cleared"]);
    let updates = h.esc.updates();
    assert_eq!(updates.len(), 1);
    let comment = &updates[0].1["comment"];
    assert!(comment.contains("This incident has now CLEARED"));
    assert!(comment.contains("cmd3 Output"));
}

#[tokio::test]
async fn cleared_without_prior_remediation_is_dropped() {
    let h = harness();
    let rem = h
        .remediator
        .process_incident(incident("TestClear", 90, IncidentType::Cleared))
        .await;
    assert!(rem.is_none());
    assert!(h.esc.updates().is_empty());
}

#[tokio::test]
async fn cleared_with_no_onclear_commands_still_comments() {
    let h = harness();
    h.store.seed(seed_rem(
        402,
        "Test1",
        91,
        Status::RemediationSuccess,
        1,
        "NET-402",
    ));
    h.esc.seed_task("NET-402", TaskStatus::Open, Utc::now());

    let rem = h
        .remediator
        .process_incident(incident("Test1", 91, IncidentType::Cleared))
        .await;

    assert!(rem.is_none());
    assert!(h.exec.executed.lock().unwrap().is_empty());
    let updates = h.esc.updates();
    assert_eq!(updates.len(), 1);
    assert!(updates[0].1["comment"].contains("This incident has now CLEARED"));
}

#[tokio::test]
async fn unknown_incident_types_are_ignored() {
    let h = harness();
    let rem = h
        .remediator
        .process_incident(incident("Test1", 93, IncidentType::Unknown))
        .await;
    assert!(rem.is_none());
    assert!(h.store.remediations().is_empty());
}

// ---- ingestion loop & shutdown ----

#[tokio::test]
async fn ingestion_drops_stale_and_disabled_incidents() {
    let h = harness();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let remediator = h.remediator.clone();
    let loop_handle = tokio::spawn(async move {
        remediator.start(shutdown_rx).await;
    });

    // Exactly at the staleness boundary: dropped.
    let mut stale = incident("Test1", 95, IncidentType::Active);
    stale.added_at = Utc::now() - chrono::Duration::seconds(300);
    h.incident_tx.send(stale).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(h.store.remediations().is_empty());

    // Disabled pipeline: dropped.
    h.remediator.disable();
    h.incident_tx
        .send(incident("Test1", 96, IncidentType::Active))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(h.store.remediations().is_empty());

    // Re-enabled: processed.
    h.remediator.enable();
    h.incident_tx
        .send(incident("Test1", 97, IncidentType::Active))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(h.store.remediations().len(), 1);

    shutdown_tx.send(true).unwrap();
    loop_handle.await.unwrap();
}

#[tokio::test]
async fn close_waits_for_in_flight_remediations() {
    let store = Arc::new(MockStore::new());
    let am = Arc::new(MockAm::default());
    let notif = Arc::new(MockNotifier::default());
    let (_tx, rx) = mpsc::channel(1);
    let config = ConfigHandler {
        config: Config {
            incident_timeout: 300,
            alert_check_interval: 0,
            ..Config::default()
        },
        rules: rules(),
    };
    let remediator = Remediator::assemble(
        Arc::new(config),
        None,
        Arc::new(SlowExecutor),
        store.clone(),
        am,
        Some(notif),
        None,
        rx,
    );

    let handler = {
        let remediator = remediator.clone();
        tokio::spawn(async move {
            remediator
                .process_incident(incident("Test1", 98, IncidentType::Active))
                .await
        })
    };
    // Let the handler reach the executor.
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;

    let started = std::time::Instant::now();
    remediator.close().await;
    assert!(store.closed());

    let rem = handler.await.unwrap().unwrap();
    assert_eq!(rem.status, Status::RemediationSuccess);
    // close() blocked until the slow phase finished.
    assert!(started.elapsed() >= std::time::Duration::from_millis(50));
}
