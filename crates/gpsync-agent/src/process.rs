use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait ProcessInspector: Send + Sync {
    /// Command names of the direct children of `pid`.
    async fn child_commands(&self, pid: u32) -> io::Result<Vec<String>>;
}

/// Reads the process table from procfs.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessInspector for ProcFs {
    async fn child_commands(&self, pid: u32) -> io::Result<Vec<String>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || scan_children(&root, pid))
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?
    }
}

fn scan_children(root: &Path, parent: u32) -> io::Result<Vec<String>> {
    let mut children = Vec::new();
    for entry in std::fs::read_dir(root)?.flatten() {
        let file_name = entry.file_name();
        if file_name.to_string_lossy().parse::<u32>().is_err() {
            continue;
        }
        // Processes can exit between listing and reading.
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some((comm, ppid)) = parse_stat(&stat) {
            if ppid == parent {
                children.push(comm);
            }
        }
    }
    children.sort();
    Ok(children)
}

/// Extracts `(comm, ppid)` from a `/proc/<pid>/stat` line. The command name is
/// wrapped in parentheses and may itself contain spaces or parentheses.
fn parse_stat(stat: &str) -> Option<(String, u32)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    if close <= open {
        return None;
    }
    let comm = stat[open + 1..close].to_string();
    let mut rest = stat[close + 1..].split_whitespace();
    let _state = rest.next()?;
    let ppid = rest.next()?.parse::<u32>().ok()?;
    Some((comm, ppid))
}
