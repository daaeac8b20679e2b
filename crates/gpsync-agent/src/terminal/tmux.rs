use super::{HostError, TerminalHost, TerminalInfo, TerminalSpec};
use async_trait::async_trait;
use gpsync_core::TASK_ID_ENV;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

const TASK_OPTION: &str = "@gitpod_task_id";
// Window name goes last so a name containing tabs stays in one field.
const WINDOW_FORMAT: &str = "#{window_id}\t#{pane_pid}\t#{@gitpod_task_id}\t#{window_name}";

/// Terminal host backed by tmux windows.
///
/// The task tag is exported into the window's environment and also stored as
/// a window user option, since tmux cannot report a window's creation env.
/// When the server or the target session does not exist yet, the first
/// terminal starts a new session.
#[derive(Debug, Clone)]
pub struct TmuxHost {
    program: String,
    session: Option<String>,
    socket: Option<PathBuf>,
}

impl TmuxHost {
    pub fn new(session: Option<String>) -> Self {
        Self {
            program: "tmux".to_string(),
            session,
            socket: None,
        }
    }

    /// Talks to the server listening on `socket` instead of the default one.
    pub fn with_socket(mut self, socket: Option<PathBuf>) -> Self {
        self.socket = socket;
        self
    }

    async fn tmux(&self, args: &[String]) -> Result<String, HostError> {
        debug!(event = "tmux_command", args = %args.join(" "));
        let mut command = Command::new(&self.program);
        if let Some(socket) = &self.socket {
            command.arg("-S").arg(socket);
        }
        let output = command
            .args(args)
            .output()
            .await
            .map_err(|source| HostError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(HostError::Command {
                command: format!("{} {}", self.program, args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn list_args(&self) -> Vec<String> {
        let mut args = vec!["list-windows".to_string()];
        match &self.session {
            Some(session) => args.extend(["-t".to_string(), session.clone()]),
            None => args.push("-a".to_string()),
        }
        args.extend(["-F".to_string(), WINDOW_FORMAT.to_string()]);
        args
    }

    fn create_args(&self, spec: &TerminalSpec) -> Vec<String> {
        let mut args = strings(&["new-window", "-d", "-P", "-F", WINDOW_FORMAT]);
        if let Some(session) = &self.session {
            args.extend(["-t".to_string(), format!("{session}:")]);
        }
        push_window_args(&mut args, spec);
        args
    }

    fn new_session_args(&self, spec: &TerminalSpec) -> Vec<String> {
        let mut args = strings(&["new-session", "-d", "-P", "-F", WINDOW_FORMAT]);
        if let Some(session) = &self.session {
            args.extend(["-s".to_string(), session.clone()]);
        }
        push_window_args(&mut args, spec);
        args
    }

    async fn open_window(&self, spec: &TerminalSpec) -> Result<String, HostError> {
        match self.tmux(&self.create_args(spec)).await {
            Err(HostError::Command { stderr, .. }) if target_missing(&stderr) => {
                info!(
                    event = "tmux_session_start",
                    session = self.session.as_deref().unwrap_or(""),
                    reason = %stderr
                );
                self.tmux(&self.new_session_args(spec)).await
            }
            result => result,
        }
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

fn push_window_args(args: &mut Vec<String>, spec: &TerminalSpec) {
    if let Some(name) = spec.name.as_deref().filter(|name| !name.is_empty()) {
        args.extend(["-n".to_string(), name.to_string()]);
    }
    for (key, value) in &spec.env {
        args.extend(["-e".to_string(), format!("{key}={value}")]);
    }
}

/// Whether tmux failed because there is no server or no such session yet.
fn target_missing(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    [
        "no server running",
        "error connecting to",
        "can't find session",
        "no current session",
        "no sessions",
    ]
    .iter()
    .any(|needle| stderr.contains(needle))
}

#[async_trait]
impl TerminalHost for TmuxHost {
    async fn list_terminals(&self) -> Result<Vec<TerminalInfo>, HostError> {
        match self.tmux(&self.list_args()).await {
            Ok(output) => Ok(output.lines().filter_map(parse_window_line).collect()),
            Err(HostError::Command { stderr, .. }) if target_missing(&stderr) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    async fn create_terminal(&self, spec: &TerminalSpec) -> Result<TerminalInfo, HostError> {
        let output = self.open_window(spec).await?;
        let mut info = output
            .lines()
            .find_map(parse_window_line)
            .ok_or_else(|| HostError::Output {
                command: "tmux new-window".to_string(),
                output: output.clone(),
            })?;
        if let Some(task_id) = spec.env.get(TASK_ID_ENV) {
            self.tmux(&[
                "set-option".to_string(),
                "-w".to_string(),
                "-t".to_string(),
                info.id.clone(),
                TASK_OPTION.to_string(),
                task_id.clone(),
            ])
            .await?;
        }
        info.env = spec.env.clone();
        Ok(info)
    }

    async fn show_terminal(&self, id: &str, preserve_focus: bool) -> Result<(), HostError> {
        if preserve_focus {
            return Ok(());
        }
        self.tmux(&["select-window".to_string(), "-t".to_string(), id.to_string()])
            .await
            .map(|_| ())
    }

    async fn send_text(&self, id: &str, text: &str, add_newline: bool) -> Result<(), HostError> {
        self.tmux(&[
            "send-keys".to_string(),
            "-t".to_string(),
            id.to_string(),
            "-l".to_string(),
            "--".to_string(),
            text.to_string(),
        ])
        .await?;
        if add_newline {
            self.tmux(&[
                "send-keys".to_string(),
                "-t".to_string(),
                id.to_string(),
                "Enter".to_string(),
            ])
            .await?;
        }
        Ok(())
    }

    async fn dispose_terminal(&self, id: &str) -> Result<(), HostError> {
        self.tmux(&["kill-window".to_string(), "-t".to_string(), id.to_string()])
            .await
            .map(|_| ())
    }
}

fn parse_window_line(line: &str) -> Option<TerminalInfo> {
    let mut fields = line.splitn(4, '\t');
    let id = fields.next()?.trim();
    if id.is_empty() {
        return None;
    }
    let pid = fields
        .next()?
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0);
    let task_id = fields.next()?.trim();
    let name = fields.next().unwrap_or("").to_string();
    let mut env = BTreeMap::new();
    if !task_id.is_empty() {
        env.insert(TASK_ID_ENV.to_string(), task_id.to_string());
    }
    Some(TerminalInfo {
        id: id.to_string(),
        name,
        pid,
        env,
    })
}
