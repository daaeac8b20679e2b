use crate::watcher::{spawn_watcher, WatcherHandle};
use async_trait::async_trait;
use gpsync_core::{PortRegistry, PortStatus, TaskRegistry, TaskStatus};
use gpsync_proto::supervisor::{
    CloseTerminalRequest, PortsStatusRequest, PortsStatusResponse, TasksStatusRequest,
    TasksStatusResponse,
};
use gpsync_proto::{lazy_channel, StatusServiceClient, TerminalServiceClient};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tonic::codec::Streaming;
use tonic::transport::Channel;
use tonic::Status;
use tracing::info;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid supervisor address {addr}: {source}")]
    Address {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("supervisor call failed: {0}")]
    Status(#[from] Status),
}

/// Control over the supervisor's remote pseudo-terminals.
#[async_trait]
pub trait RemoteTerminals: Send + Sync {
    async fn close_terminal(&self, alias: &str) -> Result<(), SupervisorError>;
}

#[derive(Debug, Clone)]
pub struct SupervisorClient {
    status: StatusServiceClient<Channel>,
    terminal: TerminalServiceClient<Channel>,
}

impl SupervisorClient {
    /// Builds the clients without dialing; the first call connects.
    pub fn connect(addr: &str) -> Result<Self, SupervisorError> {
        let channel = lazy_channel(addr).map_err(|source| SupervisorError::Address {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Self {
            status: StatusServiceClient::new(channel.clone()),
            terminal: TerminalServiceClient::new(channel),
        })
    }

    pub async fn observe_ports(&self) -> Result<Streaming<PortsStatusResponse>, Status> {
        let mut client = self.status.clone();
        let response = client
            .ports_status(PortsStatusRequest { observe: true })
            .await?;
        Ok(response.into_inner())
    }

    pub async fn observe_tasks(&self) -> Result<Streaming<TasksStatusResponse>, Status> {
        let mut client = self.status.clone();
        let response = client
            .tasks_status(TasksStatusRequest { observe: true })
            .await?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl RemoteTerminals for SupervisorClient {
    async fn close_terminal(&self, alias: &str) -> Result<(), SupervisorError> {
        let mut client = self.terminal.clone();
        client
            .close(CloseTerminalRequest {
                alias: alias.to_string(),
            })
            .await?;
        Ok(())
    }
}

/// Feeds the ports status stream into `ports` until the handle is cancelled.
pub fn watch_ports(
    client: SupervisorClient,
    ports: Arc<PortRegistry>,
    backoff: Duration,
) -> WatcherHandle {
    spawn_watcher(
        "ports",
        backoff,
        move || {
            let client = client.clone();
            async move { client.observe_ports().await }
        },
        move |response: PortsStatusResponse| {
            let observed = response.ports.into_iter().map(PortStatus::from).collect();
            let change = ports.apply_update(observed);
            if !change.is_empty() {
                info!(
                    event = "ports_changed",
                    added = ?change.added,
                    changed = ?change.changed,
                    unserved = ?change.unserved
                );
            }
        },
    )
}

/// Feeds the tasks status stream into `tasks` until the handle is cancelled.
pub fn watch_tasks(
    client: SupervisorClient,
    tasks: Arc<TaskRegistry>,
    backoff: Duration,
) -> WatcherHandle {
    spawn_watcher(
        "tasks",
        backoff,
        move || {
            let client = client.clone();
            async move { client.observe_tasks().await }
        },
        move |response: TasksStatusResponse| {
            let observed: Vec<TaskStatus> =
                response.tasks.into_iter().map(TaskStatus::from).collect();
            tasks.apply_update(observed);
        },
    )
}
