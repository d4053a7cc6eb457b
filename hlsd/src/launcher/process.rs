//! Handle to a running pipeline.
//!
//! A pipeline is one or more OS processes chained stdout to stdin, all placed
//! in the process group of the first stage so they are signalled together.
//! One waiter task owns the children and publishes the exit state; one drain
//! task per stage forwards stderr to the log.

use std::process::Stdio;
use std::time::Duration;

use process_utils::{GroupSignal, SpawnExt, signal_group};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// How a pipeline ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitState {
    /// Exit code of the last stage, `None` if it was ended by a signal.
    pub code: Option<i32>,
}

/// Result of [`PipelineProcess::terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The pipeline had already exited.
    AlreadyExited,
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Still alive after the grace period and killed.
    Killed,
}

/// One stage of a pipeline: a label for logs and the command to run.
pub struct PipelineStage {
    pub label: String,
    pub command: Command,
}

impl PipelineStage {
    pub fn new(label: impl Into<String>, command: Command) -> Self {
        Self {
            label: label.into(),
            command,
        }
    }
}

/// A spawned pipeline.
///
/// Dropping the handle without calling [`terminate`](Self::terminate) still
/// kills the processes, but nothing waits for it.
pub struct PipelineProcess {
    session_id: String,
    pid: u32,
    pgid: Option<u32>,
    exit_rx: watch::Receiver<Option<ExitState>>,
    kill_token: CancellationToken,
    drain_token: CancellationToken,
    waiter: Option<JoinHandle<()>>,
    drains: Vec<JoinHandle<()>>,
}

impl PipelineProcess {
    /// Spawn `stages` as one pipeline.
    ///
    /// The first stage reads from null, the last one writes stdout to null, and
    /// every stage's stderr is drained into the log at debug level. If a later
    /// stage fails to spawn, the stages already running are killed.
    pub fn spawn_chain(session_id: &str, stages: Vec<PipelineStage>) -> Result<Self> {
        if stages.is_empty() {
            return Err(Error::launch_failure(session_id, "pipeline has no stages"));
        }

        let count = stages.len();
        let mut children: Vec<Child> = Vec::with_capacity(count);
        let mut labels = Vec::with_capacity(count);
        let mut leader: Option<u32> = None;

        for (position, stage) in stages.into_iter().enumerate() {
            let PipelineStage { label, mut command } = stage;

            let stdin = match children.last_mut().and_then(|prev| prev.stdout.take()) {
                Some(stdout) => match TryInto::<Stdio>::try_into(stdout) {
                    Ok(stdio) => stdio,
                    Err(e) => {
                        abort_partial(session_id, leader, &mut children);
                        return Err(Error::launch_failure(session_id, e));
                    }
                },
                None => Stdio::null(),
            };
            let stdout = if position + 1 == count {
                Stdio::null()
            } else {
                Stdio::piped()
            };

            command
                .stdin(stdin)
                .stdout(stdout)
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .in_process_group(leader.unwrap_or(0));

            match command.spawn() {
                Ok(child) => {
                    if leader.is_none() {
                        leader = child.id();
                    }
                    debug!(session_id, stage = %label, pid = ?child.id(), "Spawned pipeline stage");
                    children.push(child);
                    labels.push(label);
                }
                Err(e) => {
                    abort_partial(session_id, leader, &mut children);
                    return Err(Error::launch_failure(
                        session_id,
                        format!("failed to spawn {label}: {e}"),
                    ));
                }
            }
        }

        let pid = leader.unwrap_or_default();
        let pgid = if cfg!(unix) { leader } else { None };

        let drain_token = CancellationToken::new();
        let drains = children
            .iter_mut()
            .zip(labels.iter())
            .filter_map(|(child, label)| {
                let stderr = child.stderr.take()?;
                Some(spawn_stderr_drain(
                    session_id.to_string(),
                    label.clone(),
                    stderr,
                    drain_token.clone(),
                ))
            })
            .collect();

        let kill_token = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        let waiter = spawn_pipeline_waiter(
            session_id.to_string(),
            children,
            pgid,
            kill_token.clone(),
            exit_tx,
        );

        Ok(Self {
            session_id: session_id.to_string(),
            pid,
            pgid,
            exit_rx,
            kill_token,
            drain_token,
            waiter: Some(waiter),
            drains,
        })
    }

    /// PID of the first stage (the process group leader on unix).
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    pub fn exit_state(&self) -> Option<ExitState> {
        *self.exit_rx.borrow()
    }

    /// Wait until the waiter has reaped every stage.
    pub async fn wait(&self) -> Option<ExitState> {
        let mut rx = self.exit_rx.clone();
        // The waiter always publishes before dropping the sender.
        let state = rx.wait_for(Option::is_some).await.ok().and_then(|state| *state);
        state
    }

    /// Stop the pipeline: SIGTERM the group, wait up to `grace`, then SIGKILL.
    ///
    /// Always reaps every stage and stops the stderr drains before returning.
    pub async fn terminate(mut self, grace: Duration) -> TerminateOutcome {
        let outcome = if self.has_exited() {
            TerminateOutcome::AlreadyExited
        } else {
            self.request_exit();
            match tokio::time::timeout(grace, self.wait()).await {
                Ok(_) => TerminateOutcome::Graceful,
                Err(_) => {
                    let err = Error::ProcessTimeout {
                        id: self.session_id.clone(),
                        grace,
                    };
                    warn!(session_id = %self.session_id, "{err}, killing");
                    self.kill_token.cancel();
                    TerminateOutcome::Killed
                }
            }
        };

        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.await;
        }
        self.drain_token.cancel();
        for drain in self.drains.drain(..) {
            let _ = drain.await;
        }
        outcome
    }

    fn request_exit(&self) {
        let Some(pgid) = self.pgid else {
            self.kill_token.cancel();
            return;
        };
        match signal_group(pgid, GroupSignal::Terminate) {
            Ok(true) => debug!(session_id = %self.session_id, pgid, "Sent SIGTERM to pipeline"),
            Ok(false) => debug!(session_id = %self.session_id, pgid, "Pipeline group already gone"),
            // Escalation after the grace period still applies.
            Err(e) => warn!(session_id = %self.session_id, pgid, error = %e, "Failed to signal pipeline"),
        }
    }
}

impl Drop for PipelineProcess {
    fn drop(&mut self) {
        self.kill_token.cancel();
        self.drain_token.cancel();
    }
}

impl std::fmt::Debug for PipelineProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineProcess")
            .field("session_id", &self.session_id)
            .field("pid", &self.pid)
            .field("exit", &self.exit_state())
            .finish()
    }
}

/// Kill stages spawned before a later stage failed.
/// Upper bound for reaping stages killed after a failed spawn.
const ABORT_REAP_TIMEOUT: Duration = Duration::from_secs(5);

fn abort_partial(session_id: &str, pgid: Option<u32>, children: &mut Vec<Child>) {
    if let Some(pgid) = pgid {
        let _ = signal_group(pgid, GroupSignal::Kill);
    }
    let mut children = std::mem::take(children);
    if children.is_empty() {
        return;
    }
    for child in children.iter_mut() {
        let _ = child.start_kill();
    }
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(reap_killed(session_id.to_string(), children));
        }
        Err(_) => warn!(session_id, "No runtime to reap aborted pipeline stages"),
    }
}

/// Wait for killed stages so none is left behind as a zombie.
async fn reap_killed(session_id: String, mut children: Vec<Child>) {
    for child in children.iter_mut() {
        match tokio::time::timeout(ABORT_REAP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => debug!(session_id = %session_id, ?status, "Reaped aborted stage"),
            Ok(Err(e)) => warn!(session_id = %session_id, error = %e, "Failed to reap aborted stage"),
            Err(_) => warn!(session_id = %session_id, "Aborted stage did not exit in time"),
        }
    }
}

/// Wait for every stage; the last stage's code is the pipeline's.
///
/// On cancellation the whole group is killed and reaped.
fn spawn_pipeline_waiter(
    session_id: String,
    mut children: Vec<Child>,
    pgid: Option<u32>,
    kill_token: CancellationToken,
    exit_tx: watch::Sender<Option<ExitState>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let waited = tokio::select! {
            _ = kill_token.cancelled() => None,
            code = wait_all(&mut children) => Some(code),
        };

        let code = match waited {
            Some(code) => {
                match code {
                    Some(0) => debug!(session_id = %session_id, "Pipeline exited"),
                    Some(c) => warn!(session_id = %session_id, code = c, "Pipeline exited with non-zero code"),
                    None => debug!(session_id = %session_id, "Pipeline ended by signal"),
                }
                code
            }
            None => {
                if let Some(pgid) = pgid
                    && let Err(e) = signal_group(pgid, GroupSignal::Kill)
                {
                    warn!(session_id = %session_id, pgid, error = %e, "Failed to kill pipeline group");
                }
                for child in children.iter_mut() {
                    let _ = child.start_kill();
                }
                wait_all(&mut children).await
            }
        };

        let _ = exit_tx.send(Some(ExitState { code }));
    })
}

async fn wait_all(children: &mut [Child]) -> Option<i32> {
    let count = children.len();
    let mut last_code = None;
    for (position, child) in children.iter_mut().enumerate().rev() {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(error = %e, "Error waiting for pipeline stage");
                Some(-1)
            }
        };
        if position + 1 == count {
            last_code = code;
        }
    }
    last_code
}

fn spawn_stderr_drain(
    session_id: String,
    stage: String,
    stderr: tokio::process::ChildStderr,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if !line.is_empty() {
                            debug!(session_id = %session_id, stage = %stage, "{line}");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(session_id = %session_id, stage = %stage, error = %e, "stderr read failed");
                        break;
                    }
                },
            }
        }
    })
}
