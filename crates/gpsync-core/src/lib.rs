use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub mod ports;
pub mod signal;
pub mod tasks;
pub mod view;

pub use ports::{PortRegistry, PortsChange};
pub use signal::OneShot;
pub use tasks::{TaskBatch, TaskRegistry};

/// Environment tag carried by a terminal that is bound to a supervisor task.
pub const TASK_ID_ENV: &str = "GITPOD_TASK_ID";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    pub local_port: u32,
    pub served: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_port: Option<u32>,
}

impl PortStatus {
    pub fn served(local_port: u32, global_port: Option<u32>) -> Self {
        Self {
            local_port,
            served: true,
            global_port,
        }
    }

    pub fn description(&self) -> &'static str {
        if self.served {
            "served"
        } else {
            "not served"
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    Opening,
    Running,
    Closed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Opening => "opening",
            TaskState::Running => "running",
            TaskState::Closed => "closed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown task state: {0}")]
pub struct UnknownTaskState(pub String);

impl FromStr for TaskState {
    type Err = UnknownTaskState;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "opening" => Ok(TaskState::Opening),
            "running" => Ok(TaskState::Running),
            "closed" => Ok(TaskState::Closed),
            other => Err(UnknownTaskState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: String,
    pub state: TaskState,
    /// Alias of the task's remote pseudo-terminal.
    pub terminal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation_name: Option<String>,
}

impl TaskStatus {
    pub fn new(id: impl Into<String>, state: TaskState, terminal: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state,
            terminal: terminal.into(),
            presentation_name: None,
        }
    }

    pub fn with_presentation_name(mut self, name: impl Into<String>) -> Self {
        self.presentation_name = Some(name.into());
        self
    }

    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }

    pub fn is_closed(&self) -> bool {
        self.state == TaskState::Closed
    }
}

/// Long-lived state shared by the watchers, the reconciler and the resolver.
#[derive(Debug, Clone, Default)]
pub struct SyncContext {
    pub ports: Arc<PortRegistry>,
    pub tasks: Arc<TaskRegistry>,
}

impl SyncContext {
    pub fn new() -> Self {
        Self::default()
    }
}
