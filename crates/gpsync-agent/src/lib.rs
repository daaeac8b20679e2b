pub mod config;
pub mod logging;
pub mod process;
pub mod reconciler;
pub mod resolver;
pub mod supervisor;
pub mod terminal;
pub mod watcher;

pub use reconciler::{AgentBinary, Reconciled, TerminalReconciler};
pub use resolver::ExternalPortResolver;
pub use supervisor::{watch_ports, watch_tasks, RemoteTerminals, SupervisorClient, SupervisorError};
pub use watcher::{spawn_watcher, WatcherHandle};
