use crate::process::ProcessInspector;
use crate::supervisor::RemoteTerminals;
use crate::terminal::{find_task_terminal, HostError, TerminalHost, TerminalInfo, TerminalSpec};
use gpsync_core::{TaskBatch, TaskRegistry, TaskState, TaskStatus};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, OnceCell};
use tracing::{debug, error, info, warn};

/// Longest command name the kernel reports for a process.
const COMM_MAX_LEN: usize = 15;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("terminal host: {0}")]
    Host(#[from] HostError),
    #[error("cannot inspect children of pid {pid}: {source}")]
    Inspect {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("agent binary unavailable: {0}")]
    AgentBinary(String),
}

/// What reconciling one task did to its terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// No local terminal is bound to the task.
    Unbound,
    Disposed,
    /// The task is neither running nor closed.
    Skipped,
    /// The bound terminal has no shell process yet.
    AwaitingShell,
    AlreadyAttached,
    Attached,
}

/// Location of the agent binary used to attach terminals.
///
/// Outside development mode the primary path is used as is. In development
/// mode the primary path must exist, otherwise the legacy path is tried. The
/// outcome is computed once.
#[derive(Debug)]
pub struct AgentBinary {
    primary: PathBuf,
    legacy: PathBuf,
    dev_mode: bool,
    resolved: OnceCell<Result<PathBuf, String>>,
}

impl AgentBinary {
    pub fn new(primary: impl Into<PathBuf>, legacy: impl Into<PathBuf>, dev_mode: bool) -> Self {
        Self {
            primary: primary.into(),
            legacy: legacy.into(),
            dev_mode,
            resolved: OnceCell::new(),
        }
    }

    pub async fn resolve(&self) -> Result<PathBuf, ReconcileError> {
        self.resolved
            .get_or_init(|| self.lookup())
            .await
            .clone()
            .map_err(ReconcileError::AgentBinary)
    }

    async fn lookup(&self) -> Result<PathBuf, String> {
        if !self.dev_mode {
            return Ok(self.primary.clone());
        }
        let primary_err = match tokio::fs::metadata(&self.primary).await {
            Ok(_) => return Ok(self.primary.clone()),
            Err(err) => err,
        };
        match tokio::fs::metadata(&self.legacy).await {
            Ok(_) => Ok(self.legacy.clone()),
            Err(_) => Err(format!("{}: {primary_err}", self.primary.display())),
        }
    }
}

pub fn attach_command(agent_bin: &Path, alias: &str) -> String {
    format!("{} terminal attach -ir {alias}", agent_bin.display())
}

/// Name the kernel would report for a process started from `path`.
fn process_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    name.chars().take(COMM_MAX_LEN).collect()
}

/// Keeps local terminals in step with the supervisor's tasks.
pub struct TerminalReconciler {
    tasks: Arc<TaskRegistry>,
    host: Arc<dyn TerminalHost>,
    inspector: Arc<dyn ProcessInspector>,
    remote: Arc<dyn RemoteTerminals>,
    agent: AgentBinary,
}

impl TerminalReconciler {
    pub fn new(
        tasks: Arc<TaskRegistry>,
        host: Arc<dyn TerminalHost>,
        inspector: Arc<dyn ProcessInspector>,
        remote: Arc<dyn RemoteTerminals>,
        agent: AgentBinary,
    ) -> Self {
        Self {
            tasks,
            host,
            inspector,
            remote,
            agent,
        }
    }

    /// Drives the reconciler until shutdown.
    ///
    /// `updates` must be subscribed before the first tasks batch can arrive:
    /// initial terminals are created from the first batch, and that same batch
    /// is then reconciled like every later one.
    pub async fn run(
        &self,
        mut updates: mpsc::UnboundedReceiver<TaskBatch>,
        mut closed: mpsc::UnboundedReceiver<TerminalInfo>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let initial = tokio::select! {
            initial = self.tasks.first_batch() => initial,
            _ = shutdown_requested(&mut shutdown) => return,
        };
        info!(event = "reconciler_initial_tasks", count = initial.len());
        self.create_initial_terminals(&initial).await;

        let mut closed_open = true;
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                batch = updates.recv() => match batch {
                    Some(batch) => {
                        self.update_terminals(&batch).await;
                    }
                    None => break,
                },
                terminal = closed.recv(), if closed_open => match terminal {
                    Some(terminal) => {
                        self.handle_terminal_closed(&terminal).await;
                    }
                    None => closed_open = false,
                },
            }
        }
        debug!(event = "reconciler_stopped");
    }

    /// Opens a tagged terminal for every task of the first batch that is not
    /// closed and has no terminal yet.
    pub async fn create_initial_terminals(&self, tasks: &[TaskStatus]) {
        for task in tasks {
            if task.is_closed() {
                continue;
            }
            if let Err(err) = self.ensure_terminal(task).await {
                warn!(
                    event = "task_terminal_init_failed",
                    task_id = %task.id,
                    error = %err,
                    "failed to initialize the task terminal"
                );
            }
        }
    }

    async fn ensure_terminal(&self, task: &TaskStatus) -> Result<(), ReconcileError> {
        let terminals = self.host.list_terminals().await?;
        if find_task_terminal(&terminals, &task.id).is_some() {
            return Ok(());
        }
        let spec = TerminalSpec::for_task(&task.id, task.presentation_name.clone());
        let terminal = self.host.create_terminal(&spec).await?;
        info!(
            event = "task_terminal_created",
            task_id = %task.id,
            terminal = %terminal.id
        );
        self.host.show_terminal(&terminal.id, false).await?;
        Ok(())
    }

    /// Reconciles every task of a batch. One task failing never stops the rest.
    pub async fn update_terminals(&self, tasks: &[TaskStatus]) -> Vec<Option<Reconciled>> {
        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.reconcile_task(task).await {
                Ok(outcome) => {
                    debug!(
                        event = "task_terminal_reconciled",
                        task_id = %task.id,
                        state = %task.state,
                        outcome = ?outcome
                    );
                    outcomes.push(Some(outcome));
                }
                Err(err) => {
                    warn!(
                        event = "task_terminal_update_failed",
                        task_id = %task.id,
                        error = %err,
                        "failed to update the task terminal"
                    );
                    outcomes.push(None);
                }
            }
        }
        outcomes
    }

    pub async fn reconcile_task(&self, task: &TaskStatus) -> Result<Reconciled, ReconcileError> {
        // Look at the live list: the user may have closed terminals meanwhile.
        let terminals = self.host.list_terminals().await?;
        let Some(terminal) = find_task_terminal(&terminals, &task.id) else {
            return Ok(Reconciled::Unbound);
        };
        match task.state {
            TaskState::Closed => {
                self.host.dispose_terminal(&terminal.id).await?;
                info!(
                    event = "task_terminal_disposed",
                    task_id = %task.id,
                    terminal = %terminal.id
                );
                return Ok(Reconciled::Disposed);
            }
            TaskState::Opening => return Ok(Reconciled::Skipped),
            TaskState::Running => {}
        }
        let Some(pid) = terminal.pid else {
            return Ok(Reconciled::AwaitingShell);
        };

        let (agent_bin, children) =
            tokio::join!(self.agent.resolve(), self.inspector.child_commands(pid));
        let agent_bin = agent_bin?;
        let children = children.map_err(|source| ReconcileError::Inspect { pid, source })?;
        let agent_name = process_name(&agent_bin);
        if children.iter().any(|child| *child == agent_name) {
            return Ok(Reconciled::AlreadyAttached);
        }

        let command = attach_command(&agent_bin, &task.terminal);
        self.host.send_text(&terminal.id, &command, true).await?;
        info!(
            event = "task_terminal_attached",
            task_id = %task.id,
            terminal = %terminal.id,
            alias = %task.terminal
        );
        Ok(Reconciled::Attached)
    }

    /// Closes the remote terminal of a running task whose local terminal went
    /// away. Returns whether a close request was sent.
    pub async fn handle_terminal_closed(&self, terminal: &TerminalInfo) -> bool {
        let Some(task_id) = terminal.task_id() else {
            return false;
        };
        let Some(task) = self.tasks.get(task_id) else {
            return false;
        };
        if !task.is_running() {
            return false;
        }
        match self.remote.close_terminal(&task.terminal).await {
            Ok(()) => info!(
                event = "remote_terminal_closed",
                task_id = %task.id,
                alias = %task.terminal
            ),
            Err(err) => error!(
                event = "remote_terminal_close_failed",
                task_id = %task.id,
                alias = %task.terminal,
                error = %err,
                "failed to close the remote terminal"
            ),
        }
        true
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
