use async_trait::async_trait;
use gpsync_core::TASK_ID_ENV;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub mod tmux;

pub use tmux::TmuxHost;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("unexpected output from `{command}`: {output:?}")]
    Output { command: String, output: String },
}

/// A terminal living in the host, as last listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalInfo {
    pub id: String,
    pub name: String,
    /// Process id of the terminal's shell, once it has started.
    pub pid: Option<u32>,
    /// Environment the terminal was created with, as far as the host retains it.
    pub env: BTreeMap<String, String>,
}

impl TerminalInfo {
    pub fn task_id(&self) -> Option<&str> {
        self.env
            .get(TASK_ID_ENV)
            .map(String::as_str)
            .filter(|task_id| !task_id.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminalSpec {
    pub name: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl TerminalSpec {
    /// A terminal tagged with `task_id` so it can be found again later.
    pub fn for_task(task_id: &str, name: Option<String>) -> Self {
        Self {
            name,
            env: BTreeMap::from([(TASK_ID_ENV.to_string(), task_id.to_string())]),
        }
    }
}

#[async_trait]
pub trait TerminalHost: Send + Sync {
    async fn list_terminals(&self) -> Result<Vec<TerminalInfo>, HostError>;
    async fn create_terminal(&self, spec: &TerminalSpec) -> Result<TerminalInfo, HostError>;
    async fn show_terminal(&self, id: &str, preserve_focus: bool) -> Result<(), HostError>;
    async fn send_text(&self, id: &str, text: &str, add_newline: bool) -> Result<(), HostError>;
    async fn dispose_terminal(&self, id: &str) -> Result<(), HostError>;
}

/// First terminal bound to `task_id`.
pub fn find_task_terminal<'a>(
    terminals: &'a [TerminalInfo],
    task_id: &str,
) -> Option<&'a TerminalInfo> {
    terminals
        .iter()
        .find(|terminal| terminal.task_id() == Some(task_id))
}

/// Polls the host and emits every terminal that disappeared since the last poll.
pub fn spawn_close_poller(
    host: Arc<dyn TerminalHost>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> mpsc::UnboundedReceiver<TerminalInfo> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut known: Option<HashMap<String, TerminalInfo>> = None;
        let mut failure_streak: u32 = 0;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let latest = match host.list_terminals().await {
                        Ok(latest) => latest,
                        Err(err) => {
                            failure_streak = failure_streak.saturating_add(1);
                            let backoff_ms = 150u64.saturating_mul(2u64.saturating_pow(failure_streak.min(4)));
                            warn!(
                                event = "terminal_poll_error",
                                error = %err,
                                failure_streak,
                                backoff_ms
                            );
                            tokio::select! {
                                _ = shutdown.changed() => break,
                                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => continue,
                            }
                        }
                    };
                    if failure_streak > 0 {
                        info!(event = "terminal_poll_recovered", failure_streak);
                    }
                    failure_streak = 0;

                    if known.is_none() {
                        debug!(event = "terminal_poll_baseline", count = latest.len());
                        known = Some(index_terminals(latest));
                        continue;
                    }
                    let previous = known.get_or_insert_with(HashMap::new);
                    for terminal in diff_closed(previous, latest) {
                        info!(
                            event = "terminal_closed",
                            terminal = %terminal.id,
                            task_id = terminal.task_id().unwrap_or("")
                        );
                        if tx.send(terminal).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });
    rx
}

fn index_terminals(terminals: Vec<TerminalInfo>) -> HashMap<String, TerminalInfo> {
    terminals
        .into_iter()
        .map(|terminal| (terminal.id.clone(), terminal))
        .collect()
}

fn diff_closed(
    known: &mut HashMap<String, TerminalInfo>,
    latest: Vec<TerminalInfo>,
) -> Vec<TerminalInfo> {
    let latest = index_terminals(latest);
    let mut closed: Vec<_> = known
        .iter()
        .filter(|(id, _)| !latest.contains_key(*id))
        .map(|(_, terminal)| terminal.clone())
        .collect();
    closed.sort_by(|a, b| a.id.cmp(&b.id));
    *known = latest;
    closed
}
