use crate::{CmdResult, Command, Executor, DEFAULT_TIMEOUT_SECS, RUNNER_SCRIPT};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Runs playbook commands as child processes of the wrapper script.
pub struct ScriptExecutor {
    scripts_path: PathBuf,
    common_opts_file: PathBuf,
}

impl ScriptExecutor {
    pub fn new(scripts_path: impl Into<PathBuf>, common_opts_file: impl Into<PathBuf>) -> Self {
        Self {
            scripts_path: scripts_path.into(),
            common_opts_file: common_opts_file.into(),
        }
    }
}

#[async_trait]
impl Executor for ScriptExecutor {
    async fn execute(&self, cmds: Vec<Command>, max_parallel: usize) -> Vec<(Command, CmdResult)> {
        let sem = Arc::new(Semaphore::new(max_parallel.max(1)));
        let mut tasks = JoinSet::new();
        for cmd in cmds {
            let sem = sem.clone();
            let scripts_path = self.scripts_path.clone();
            let common_opts_file = self.common_opts_file.clone();
            tasks.spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    // The semaphore outlives every permit; closing it is unreachable.
                    let res =
                        CmdResult::failed_to_run("executor semaphore closed".into(), Duration::ZERO);
                    return (cmd, res);
                };
                let result = run_command(&scripts_path, &common_opts_file, &cmd).await;
                (cmd, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(e) => tracing::error!(error = %e, "command task failed to join"),
            }
        }
        results
    }
}

async fn run_command(scripts_path: &Path, common_opts_file: &Path, cmd: &Command) -> CmdResult {
    let started = Instant::now();
    let deadline = Duration::from_secs(if cmd.timeout == 0 {
        DEFAULT_TIMEOUT_SECS
    } else {
        cmd.timeout
    });
    let runner = scripts_path.join(RUNNER_SCRIPT);

    let input = match serde_json::to_vec(&cmd.input) {
        Ok(buf) => buf,
        Err(e) => {
            return CmdResult::failed_to_run(
                format!("unable to marshal stdin for {}: {e}", cmd.command),
                started.elapsed(),
            )
        }
    };

    let mut child_cmd = tokio::process::Command::new(&runner);
    child_cmd
        .arg("--scripts_path")
        .arg(scripts_path)
        .arg("--script_name")
        .arg(&cmd.command)
        .arg("--common_opts_file")
        .arg(common_opts_file)
        .args(&cmd.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if !cmd.env.is_empty() {
        child_cmd.env_clear();
        for pair in &cmd.env {
            if let Some((key, value)) = pair.split_once('=') {
                child_cmd.env(key, value);
            }
        }
    }

    // Own process group so the deadline can kill the whole tree.
    #[cfg(unix)]
    child_cmd.process_group(0);

    let mut child = match child_cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return CmdResult::failed_to_run(
                format!("unable to start {}: {e}", runner.display()),
                started.elapsed(),
            )
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(&input).await {
            tracing::warn!(command = %cmd.command, error = %e, "failed to write incident to stdin");
        }
        // Dropping closes stdin so the script sees EOF.
    }

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_fut = async {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stdout_pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    };
    let stderr_fut = async {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stderr_pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    };

    // Drain stdio fully before collecting the exit status.
    let run = async {
        let (stdout, stderr) = tokio::join!(stdout_fut, stderr_fut);
        let status = child.wait().await;
        (stdout, stderr, status)
    };

    match tokio::time::timeout(deadline, run).await {
        Ok((stdout, stderr, status)) => {
            let ret_code = match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    return CmdResult::failed_to_run(
                        format!("failed to collect exit status for {}: {e}", cmd.command),
                        started.elapsed(),
                    )
                }
            };
            CmdResult {
                ret_code,
                error: None,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                runtime: started.elapsed(),
            }
        }
        Err(_) => {
            tracing::warn!(command = %cmd.command, timeout_secs = deadline.as_secs(), "command deadline exceeded, killing process group");
            kill_process_group(&mut child);
            let ret_code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            CmdResult {
                ret_code: if ret_code == 0 { -1 } else { ret_code },
                error: None,
                stdout: String::new(),
                stderr: format!("killed after {}s deadline", deadline.as_secs()),
                runtime: started.elapsed(),
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut tokio::process::Child) {
    let _ = child.start_kill();
}
