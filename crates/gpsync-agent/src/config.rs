use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SUPERVISOR_ADDR: &str = "localhost:22999";
pub const DEFAULT_LOG_DIR: &str = ".gpsync/logs";
pub const PRIMARY_AGENT_BIN: &str = "/.supervisor/supervisor";
pub const LEGACY_AGENT_BIN: &str = "/theia/supervisor";

/// Raw command-line values; empty strings mean "not given".
#[derive(Clone, Debug, Default)]
pub struct ConfigFlags {
    pub supervisor_addr: String,
    pub dev_mode: bool,
    pub backoff_ms: u64,
    pub tmux_session: String,
    pub tmux_socket: String,
    pub terminal_poll_ms: u64,
    pub log_dir: String,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub supervisor_addr: String,
    pub dev_mode: bool,
    pub backoff: Duration,
    pub tmux_session: Option<String>,
    /// Socket of the tmux server; tmux's default when unset.
    pub tmux_socket: Option<PathBuf>,
    pub terminal_poll: Duration,
    pub log_dir: String,
    pub log_stdout: bool,
    pub agent_bin: PathBuf,
    pub legacy_agent_bin: PathBuf,
}

impl AgentConfig {
    pub fn resolve(flags: ConfigFlags) -> Self {
        let tmux_session = pick(&flags.tmux_session, env::var("GPSYNC_TMUX_SESSION").ok(), "");
        let tmux_socket = pick(&flags.tmux_socket, env::var("GPSYNC_TMUX_SOCKET").ok(), "");
        Self {
            supervisor_addr: pick(
                &flags.supervisor_addr,
                env::var("SUPERVISOR_ADDR").ok(),
                DEFAULT_SUPERVISOR_ADDR,
            ),
            dev_mode: resolve_dev_mode(flags.dev_mode),
            backoff: Duration::from_millis(flags.backoff_ms.max(1)),
            tmux_session: (!tmux_session.is_empty()).then_some(tmux_session),
            tmux_socket: (!tmux_socket.is_empty()).then(|| PathBuf::from(tmux_socket)),
            terminal_poll: Duration::from_millis(flags.terminal_poll_ms.max(50)),
            log_dir: pick(&flags.log_dir, env::var("GPSYNC_LOG_DIR").ok(), DEFAULT_LOG_DIR),
            log_stdout: resolve_log_stdout(),
            agent_bin: PathBuf::from(PRIMARY_AGENT_BIN),
            legacy_agent_bin: PathBuf::from(LEGACY_AGENT_BIN),
        }
    }
}

/// Flag first, then the environment, then the default.
fn pick(flag: &str, env_value: Option<String>, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    match env_value {
        Some(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn resolve_dev_mode(flag: bool) -> bool {
    if flag {
        return true;
    }
    if let Some(enabled) = env::var("GPSYNC_DEV_MODE")
        .ok()
        .and_then(|value| parse_bool_env(&value))
    {
        return enabled;
    }
    env::var("VSCODE_DEV")
        .map(|value| !value.is_empty())
        .unwrap_or(false)
}

fn resolve_log_stdout() -> bool {
    env::var("GPSYNC_LOG_STDOUT")
        .ok()
        .and_then(|value| parse_bool_env(&value))
        .unwrap_or(false)
}

pub fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" | "off" | "OFF" => Some(false),
        _ => None,
    }
}
