use crate::config::{ConfigHandler, Rule};
use autorem_alertmgr::{AlertManager, AlertManagerApi, ALERT_PATH};
use autorem_common::types::{CommandRecord, Incident, IncidentType, Remediation, Status};
use autorem_escalate::{Escalator, JiraEscalator, Task, TaskStatus, Tasks};
use autorem_executor::{Command, Executor, ScriptExecutor};
use autorem_notify::{Notifier, SlackNotifier};
use autorem_queue::{AmqpQueue, IncidentQueue};
use autorem_storage::{SqlStore, Store};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[cfg(test)]
mod tests;

/// The orchestrator: consumes incidents, applies the remediation state
/// machine and drives the executor, store, alert manager, escalator and
/// notifier.
pub struct Remediator {
    config: Arc<ConfigHandler>,
    queue: Option<Box<dyn IncidentQueue>>,
    executor: Arc<dyn Executor>,
    store: Arc<dyn Store>,
    am: Arc<dyn AlertManagerApi>,
    notifier: Option<Arc<dyn Notifier>>,
    escalator: Option<Arc<dyn Escalator>>,
    recv: std::sync::Mutex<Option<mpsc::Receiver<Incident>>>,
    /// In-flight remediations by id; `close` waits on every receiver
    /// before shutting the store.
    exe: std::sync::Mutex<HashMap<i64, watch::Receiver<bool>>>,
    enabled: AtomicBool,
}

/// Removes the in-flight entry and drops the completion sender when a
/// phase returns, releasing anyone blocked in [`Remediator::close`].
struct InFlightGuard<'a> {
    exe: &'a std::sync::Mutex<HashMap<i64, watch::Receiver<bool>>>,
    id: i64,
    _done: watch::Sender<bool>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut exe) = self.exe.lock() {
            exe.remove(&self.id);
        }
    }
}

fn attach_input(incident: &Incident, cmds: &[Command]) -> Vec<Command> {
    cmds.iter()
        .map(|cmd| {
            let mut cmd = cmd.clone();
            cmd.input = Some(incident.clone());
            cmd
        })
        .collect()
}

fn phase_failed_status(phase: &str) -> Status {
    format!("{phase}_failed").parse().unwrap_or(Status::Error)
}

impl Remediator {
    /// Boots every required component from the configuration file.
    /// Errors here are fatal: queue, database and alert-manager auth must
    /// all succeed before any incident is consumed.
    pub async fn new(config_path: &str) -> anyhow::Result<Arc<Remediator>> {
        let handler = ConfigHandler::load(config_path)?;
        let config = handler.config.clone();

        let mut queue = AmqpQueue::connect(
            &config.amqp_qname,
            &config.amqp_addr,
            &config.amqp_user,
            &config.amqp_pass,
        )
        .await?;
        let (tx, rx) = mpsc::channel(1);
        queue.register(tx);

        let store = SqlStore::connect(&config.db_url(), Duration::from_secs(config.db_timeout))
            .await?;
        let am = AlertManager::connect(
            &config.alert_manager_addr,
            &config.am_username,
            &config.am_password,
            &config.am_owner,
            &config.am_team,
        )
        .await?;
        let executor = ScriptExecutor::new(&config.scripts_path, &config.common_opts_file);

        let notifier: Option<Arc<dyn Notifier>> = if config.slack_url.is_empty() {
            None
        } else {
            Some(Arc::new(SlackNotifier::new(
                &config.slack_url,
                &config.slack_channel,
                &config.slack_mention,
            )?))
        };
        let escalator: Option<Arc<dyn Escalator>> = if config.jira_url.is_empty() {
            None
        } else {
            Some(Arc::new(JiraEscalator::new(
                &config.jira_url,
                &config.jira_username,
                &config.jira_password,
                &config.jira_project,
            )?))
        };

        Ok(Remediator::assemble(
            Arc::new(handler),
            Some(Box::new(queue)),
            Arc::new(executor),
            Arc::new(store),
            Arc::new(am),
            notifier,
            escalator,
            rx,
        ))
    }

    /// Wires a remediator from pre-built components. Used by [`new`] and
    /// by tests substituting in-memory doubles.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        config: Arc<ConfigHandler>,
        queue: Option<Box<dyn IncidentQueue>>,
        executor: Arc<dyn Executor>,
        store: Arc<dyn Store>,
        am: Arc<dyn AlertManagerApi>,
        notifier: Option<Arc<dyn Notifier>>,
        escalator: Option<Arc<dyn Escalator>>,
        recv: mpsc::Receiver<Incident>,
    ) -> Arc<Remediator> {
        Arc::new(Remediator {
            config,
            queue,
            executor,
            store,
            am,
            notifier,
            escalator,
            recv: std::sync::Mutex::new(Some(recv)),
            exe: std::sync::Mutex::new(HashMap::new()),
            enabled: AtomicBool::new(true),
        })
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn config(&self) -> Arc<ConfigHandler> {
        self.config.clone()
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        tracing::info!("pipeline enabled");
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        tracing::info!("pipeline disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Main ingestion loop. Runs until the shutdown signal fires or the
    /// incident channel closes; handlers are spawned fire-and-forget and
    /// tracked through the in-flight map.
    pub async fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let recv = match self.recv.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(mut recv) = recv else {
            tracing::warn!("ingestion loop already started");
            return;
        };
        tracing::info!("waiting for incidents");
        loop {
            tokio::select! {
                incident = recv.recv() => {
                    let Some(incident) = incident else {
                        tracing::info!("incident channel closed");
                        return;
                    };
                    let age = Utc::now().signed_duration_since(incident.added_at);
                    if age.num_seconds() >= self.config.config.incident_timeout as i64 {
                        tracing::debug!(id = incident.id, name = %incident.name, "not processing timed out incident");
                        continue;
                    }
                    if !self.is_enabled() {
                        tracing::info!(id = incident.id, "pipeline disabled, dropping incident");
                        continue;
                    }
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        this.process_incident(incident).await;
                    });
                }
                _ = shutdown.changed() => {
                    tracing::info!("stopping ingestion loop");
                    return;
                }
            }
        }
    }

    /// Blocks until every in-flight remediation has signalled completion,
    /// then closes the store.
    pub async fn close(&self) {
        if let Some(queue) = &self.queue {
            if let Err(e) = queue.shutdown().await {
                tracing::warn!(error = %e, "queue shutdown failed");
            }
        }
        let pending: Vec<(i64, watch::Receiver<bool>)> = match self.exe.lock() {
            Ok(exe) => exe.iter().map(|(id, rx)| (*id, rx.clone())).collect(),
            Err(_) => Vec::new(),
        };
        tracing::info!(pending = pending.len(), "waiting for pending remediations to finish");
        for (id, mut rx) in pending {
            while rx.changed().await.is_ok() {}
            tracing::debug!(remediation = id, "done executing remediation");
        }
        if let Err(e) = self.store.close().await {
            tracing::error!(error = %e, "failed to close store");
        }
    }

    /// Per-incident handler: rule gate, aggregate expansion, dispatch.
    pub async fn process_incident(&self, mut incident: Incident) -> Option<Remediation> {
        tracing::debug!(name = %incident.name, id = incident.id, "processing incident");
        let Some(rule) = self.config.rule_by_name(&incident.name) else {
            tracing::error!(name = %incident.name, "no rule defined for incident");
            return None;
        };
        if !rule.enabled {
            tracing::error!(rule = %rule.alert_name, "rule defined but not enabled");
            return None;
        }
        if incident.is_aggregate {
            if !self.expand_aggregate(&mut incident).await {
                return None;
            }
        }
        match incident.incident_type {
            IncidentType::Active => self.process_active(incident, rule).await,
            IncidentType::Cleared => self.process_cleared(incident, rule).await,
            IncidentType::Unknown => None,
        }
    }

    /// Attaches component alerts under `data["components"]` and derives
    /// the entity list from them. Idempotent for a fixed upstream answer.
    async fn expand_aggregate(&self, incident: &mut Incident) -> bool {
        let suffix = format!("{ALERT_PATH}?agg_id={}", incident.id);
        let components = match self.am.get_alerts(&suffix).await {
            Ok(components) => components,
            Err(e) => {
                tracing::error!(id = incident.id, error = %e, "failed to query components for incident");
                return false;
            }
        };
        let entities: Vec<String> = components
            .iter()
            .filter_map(|component| {
                let entity = component.get("entity")?.as_str()?.to_string();
                match component.get("device").and_then(|d| d.as_str()) {
                    Some(device) => Some(format!("{device}:{entity}")),
                    None => Some(entity),
                }
            })
            .collect();
        if !entities.is_empty() {
            incident
                .data
                .insert("entities".to_string(), serde_json::json!(entities));
        }
        incident.data.insert(
            "components".to_string(),
            serde_json::to_value(components).unwrap_or_default(),
        );
        true
    }

    /// Dedup lookup: prior remediations for this incident (by id, falling
    /// back to name+entity), restricted to those whose tracker task is
    /// still open, picking the one with the latest task creation.
    async fn remediation_for_incident(&self, incident: &Incident) -> Option<Remediation> {
        let mut rems = match self.store.remediations_by_incident(incident.id).await {
            Ok(rems) => rems,
            Err(e) => {
                tracing::error!(id = incident.id, error = %e, "failed to query remediations");
                Vec::new()
            }
        };
        if rems.is_empty() {
            rems = match self
                .store
                .remediations_by_entity(&incident.name, &incident.entities())
                .await
            {
                Ok(rems) => rems,
                Err(e) => {
                    tracing::error!(name = %incident.name, error = %e, "failed to query remediations");
                    Vec::new()
                }
            };
        }
        if rems.is_empty() {
            return None;
        }
        rems.sort_by(|a, b| b.start_time.cmp(&a.start_time));

        let Some(esc) = &self.escalator else {
            // No tracker to consult; the newest attempt is the current one.
            return rems.into_iter().next();
        };

        let mut open: Vec<(Remediation, Task)> = Vec::new();
        for rem in rems {
            if rem.task_id.is_empty() {
                continue;
            }
            let mut task = Task::with_id(&rem.task_id);
            if let Err(e) = esc.load_task(&mut task).await {
                tracing::warn!(task = %rem.task_id, error = %e, "failed to load task");
                continue;
            }
            if task.status == TaskStatus::Open {
                open.push((rem, task));
            }
        }
        let latest = Tasks(open.iter().map(|(_, task)| task.clone()).collect()).latest()?;
        open.into_iter()
            .find(|(_, task)| task.id == latest.id)
            .map(|(rem, _)| rem)
    }

    async fn process_active(&self, mut incident: Incident, rule: Rule) -> Option<Remediation> {
        let existing = self.remediation_for_incident(&incident).await;
        if let Some(rem) = &existing {
            tracing::info!(
                remediation = rem.id,
                status = %rem.status,
                incident = incident.id,
                "found existing remediation"
            );
            if rem.status == Status::RemediationSuccess
                || (rem.status.is_failed() && rem.attempts >= rule.attempts)
            {
                // Terminal for this incident; just acknowledge upstream.
                self.ack(incident.id).await;
                return existing;
            }
        }

        let interval = Duration::from_secs(self.config.config.alert_check_interval);
        let window = Duration::from_secs(rule.up_check_duration);
        if !self
            .am
            .assert_status("ACTIVE", incident.id, interval, window)
            .await
        {
            tracing::debug!(id = incident.id, "alert is not ACTIVE, skip remediation run");
            return None;
        }
        tracing::debug!(name = %incident.name, "incident is active, proceeding with remediation");

        let mut rem = existing.unwrap_or_else(|| Remediation::from_incident(&incident));
        if rem.id == 0 {
            match self.store.new_remediation(&rem).await {
                Ok(id) => {
                    rem.id = id;
                    tracing::info!(remediation = id, incident = incident.id, "created new remediation");
                }
                Err(e) => tracing::error!(error = %e, "failed to save remediation to db"),
            }
        }
        rem.attempts += 1;

        let task_created = self.ensure_task(&mut rem, &mut incident, &rule).await;

        let cmds = attach_input(&incident, &rule.audits);
        let (mut outputs, passed) = self.run_phase(&mut rem, "audit", cmds).await;
        if !passed {
            tracing::error!(incident = incident.id, "audit run failed, not running remediations");
            self.notify(&rem, "Audit run failed, not running remediations")
                .await;
            self.finish_task_update(&mut rem, &rule, &outputs, task_created, false)
                .await;
            return Some(rem);
        }

        let cmds = attach_input(&incident, &rule.remediations);
        let (more, passed) = self.run_phase(&mut rem, "remediation", cmds).await;
        outputs.extend(more);
        if !passed {
            tracing::error!(incident = incident.id, "remediation run failed");
            self.notify(&rem, "Remediation run failed").await;
        } else {
            rem.end(Status::RemediationSuccess);
            self.persist(&rem).await;
            self.notify(&rem, "Remediation Successful").await;
        }
        self.ack(incident.id).await;
        self.finish_task_update(&mut rem, &rule, &outputs, task_created, false)
            .await;
        Some(rem)
    }

    async fn process_cleared(&self, incident: Incident, rule: Rule) -> Option<Remediation> {
        tracing::debug!(id = incident.id, "incident has now cleared");
        let Some(mut rem) = self.remediation_for_incident(&incident).await else {
            tracing::debug!(id = incident.id, "cant find remediation for incident");
            return None;
        };
        if rule.on_clear.is_empty() {
            tracing::debug!(id = incident.id, "nothing to do for incident clear");
            self.finish_task_update(&mut rem, &rule, &[], false, true).await;
            return None;
        }
        if rem.status != Status::RemediationSuccess {
            tracing::debug!(
                remediation = rem.id,
                incident = incident.id,
                "remediation was not successful, skip onclear run"
            );
            self.finish_task_update(&mut rem, &rule, &[], false, true).await;
            return Some(rem);
        }
        let cmds = attach_input(&incident, &rule.on_clear);
        let (outputs, passed) = self.run_phase(&mut rem, "onclear", cmds).await;
        if passed {
            rem.end(Status::OnclearSuccess);
            self.persist(&rem).await;
            self.notify(&rem, "Incident cleared").await;
        }
        self.finish_task_update(&mut rem, &rule, &outputs, false, true)
            .await;
        Some(rem)
    }

    /// Runs one phase through the executor: registers the in-flight
    /// signal, persists a command record per result, and stops the phase
    /// at the first failure.
    async fn run_phase(
        &self,
        rem: &mut Remediation,
        phase: &str,
        cmds: Vec<Command>,
    ) -> (Vec<CommandRecord>, bool) {
        tracing::debug!(phase, remediation = rem.id, incident = rem.incident_id, "running phase");
        let (done_tx, done_rx) = watch::channel(false);
        if let Ok(mut exe) = self.exe.lock() {
            exe.insert(rem.id, done_rx);
        }
        let _guard = InFlightGuard {
            exe: &self.exe,
            id: rem.id,
            _done: done_tx,
        };

        let max_parallel = cmds.len();
        let results = self.executor.execute(cmds, max_parallel).await;

        let mut records = Vec::new();
        for (cmd, result) in results {
            tracing::debug!(command = %cmd.name, logs = %result.stderr, output = %result.stdout, "command finished");
            let mut record = CommandRecord {
                id: 0,
                remediation_id: rem.id,
                command: cmd.command.clone(),
                retcode: result.ret_code,
                runtime: result.runtime.as_secs() as i64,
                logs: result.stderr.clone(),
                results: result.stdout.clone(),
            };
            if let Some(err) = &result.error {
                record.results = format!("Failed to run cmd {}: {err}", cmd.name);
            }
            match self.store.new_command(&record).await {
                Ok(id) => record.id = id,
                Err(e) => tracing::error!(error = %e, "failed to save cmd to db"),
            }

            if result.error.is_some() {
                tracing::error!(command = %cmd.name, error = ?result.error, "command could not be run");
                rem.end(Status::Error);
                self.persist(rem).await;
                records.push(record);
                return (records, false);
            }
            if result.ret_code != 0 {
                tracing::info!(
                    command = %cmd.name,
                    retcode = result.ret_code,
                    incident = %rem.incident_name,
                    "{phase} failed"
                );
                rem.end(phase_failed_status(phase));
                self.persist(rem).await;
                records.push(record);
                return (records, false);
            }
            records.push(record);
        }
        (records, true)
    }

    /// Lazily creates the tracker task at the first attempt and exposes
    /// its id to the playbook scripts. Returns whether the task was
    /// created during this attempt.
    async fn ensure_task(
        &self,
        rem: &mut Remediation,
        incident: &mut Incident,
        rule: &Rule,
    ) -> bool {
        if !rem.task_id.is_empty() {
            incident
                .data
                .insert("task_id".to_string(), serde_json::json!(rem.task_id));
            return false;
        }
        if rule.dont_escalate {
            return false;
        }
        let Some(esc) = &self.escalator else {
            return false;
        };
        let project = if rule.jira_project.is_empty() {
            self.config.config.jira_project.clone()
        } else {
            rule.jira_project.clone()
        };
        let mut task = Task::with_id("");
        task.title = format!("Incident: {}:{}", incident.id, incident.name);
        task.params.insert("project".to_string(), project);
        match esc.create_task(&mut task).await {
            Ok(()) => {
                rem.task_id = task.id.clone();
                incident
                    .data
                    .insert("task_id".to_string(), serde_json::json!(task.id));
                true
            }
            Err(e) => {
                tracing::error!(incident = incident.id, error = %e, "failed to create task");
                false
            }
        }
    }

    /// Deferred update at handler exit: push accumulated command output
    /// to the task, then write the remediation back.
    async fn finish_task_update(
        &self,
        rem: &mut Remediation,
        rule: &Rule,
        outputs: &[CommandRecord],
        task_created: bool,
        cleared: bool,
    ) {
        self.escalate(rem, rule, outputs, task_created, cleared).await;
        self.persist(rem).await;
    }

    async fn escalate(
        &self,
        rem: &Remediation,
        rule: &Rule,
        outputs: &[CommandRecord],
        task_created: bool,
        cleared: bool,
    ) {
        let Some(esc) = &self.escalator else {
            return;
        };
        if rule.dont_escalate || rem.task_id.is_empty() {
            return;
        }
        let mut description = String::new();
        for out in outputs {
            description.push_str(&format!("{} Output: \n{}\n\n", out.command, out.results));
        }

        let mut task = Task::with_id(&rem.task_id);
        if cleared {
            let mut comment = String::from("This incident has now CLEARED");
            if !description.is_empty() {
                comment.push('\n');
                comment.push_str(&description);
            }
            task.params.insert("comment".to_string(), comment);
        } else if task_created {
            // The ticket was opened this attempt; its body is the output.
            if description.is_empty() {
                return;
            }
            task.params.insert("description".to_string(), description);
        } else {
            if description.is_empty() {
                return;
            }
            task.params.insert("comment".to_string(), description);
        }
        if let Err(e) = esc.update_task(&task).await {
            tracing::error!(
                remediation = rem.id,
                task = %rem.task_id,
                error = %e,
                "failed to escalate"
            );
        }
    }

    async fn ack(&self, incident_id: i64) {
        if let Err(e) = self.am.post_ack(incident_id).await {
            tracing::error!(id = incident_id, error = %e, "failed to ack alert");
        }
    }

    async fn notify(&self, rem: &Remediation, msg: &str) {
        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.send(rem, msg).await {
                tracing::error!(remediation = rem.id, error = %e, "failed to send notification");
            }
        }
    }

    async fn persist(&self, rem: &Remediation) {
        if rem.id == 0 {
            return;
        }
        if let Err(e) = self.store.update_remediation(rem).await {
            tracing::error!(remediation = rem.id, error = %e, "failed to update remediation in db");
        }
    }
}
