use gpsync_core::{PortStatus, TaskState};
use tracing::warn;

pub mod client;
pub mod supervisor;

pub use client::{lazy_channel, StatusServiceClient, TerminalServiceClient};

impl From<supervisor::PortsStatus> for PortStatus {
    fn from(port: supervisor::PortsStatus) -> Self {
        let global_port = (port.global_port != 0).then_some(port.global_port);
        PortStatus::served(port.local_port, global_port)
    }
}

pub fn task_state(value: i32) -> TaskState {
    match supervisor::TaskState::try_from(value) {
        Ok(supervisor::TaskState::Opening) => TaskState::Opening,
        Ok(supervisor::TaskState::Running) => TaskState::Running,
        Ok(supervisor::TaskState::Closed) => TaskState::Closed,
        Err(_) => {
            warn!(event = "task_state_unknown", value);
            TaskState::Opening
        }
    }
}

impl From<supervisor::TaskStatus> for gpsync_core::TaskStatus {
    fn from(task: supervisor::TaskStatus) -> Self {
        let presentation_name = task
            .presentation
            .map(|presentation| presentation.name)
            .filter(|name| !name.is_empty());
        gpsync_core::TaskStatus {
            id: task.id,
            state: task_state(task.state),
            terminal: task.terminal,
            presentation_name,
        }
    }
}
