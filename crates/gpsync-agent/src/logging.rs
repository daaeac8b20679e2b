use crate::config::AgentConfig;
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

type SharedLog = Arc<Mutex<File>>;

/// Keeps the log file open while the process runs.
pub struct LogGuard {
    path: Option<PathBuf>,
    _file: Option<SharedLog>,
}

impl LogGuard {
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Every place a formatted event is copied to.
#[derive(Clone)]
struct Sinks {
    stdout: bool,
    file: Option<SharedLog>,
}

impl Sinks {
    fn each(&self, mut op: impl FnMut(&mut dyn Write) -> io::Result<()>) {
        if self.stdout {
            let _ = op(&mut io::stdout());
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = op(&mut *file);
        }
    }
}

// A failing sink never fails the event.
impl Write for Sinks {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.each(|sink| sink.write_all(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.each(|sink| sink.flush());
        Ok(())
    }
}

/// Installs the global subscriber. `label` names the log file, one per
/// subcommand, so concurrent invocations do not interleave.
pub fn init_logging(config: &AgentConfig, label: &str) -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(env::var("GPSYNC_LOG_LEVEL").ok())));

    let path = log_path(&config.log_dir, label);
    let file = match path.as_deref().map(open_log).transpose() {
        Ok(file) => file,
        Err(err) => {
            eprintln!("gpsync-agent: log file unavailable, logging to stdout: {err}");
            None
        }
    };
    let sinks = Sinks {
        stdout: config.log_stdout || file.is_none(),
        file: file.clone(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(BoxMakeWriter::new(move || sinks.clone()))
        .with_ansi(false)
        .try_init()
        .ok()?;

    Some(LogGuard {
        path: path.filter(|_| file.is_some()),
        _file: file,
    })
}

fn default_level(configured: Option<String>) -> String {
    configured
        .map(|level| level.trim().to_string())
        .filter(|level| !level.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

fn log_path(log_dir: &str, label: &str) -> Option<PathBuf> {
    let log_dir = log_dir.trim();
    if log_dir.is_empty() {
        return None;
    }
    let label: String = label
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '-' })
        .collect();
    Some(Path::new(log_dir).join(format!("gpsync-agent-{label}.log")))
}

fn open_log(path: &Path) -> io::Result<SharedLog> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Arc::new(Mutex::new(file)))
}
