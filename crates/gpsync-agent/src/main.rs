use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gpsync_agent::config::{AgentConfig, ConfigFlags};
use gpsync_agent::logging::init_logging;
use gpsync_agent::process::ProcFs;
use gpsync_agent::terminal::{spawn_close_poller, TerminalHost, TmuxHost};
use gpsync_agent::{
    watch_ports, watch_tasks, AgentBinary, ExternalPortResolver, SupervisorClient,
    TerminalReconciler,
};
use gpsync_core::{view, SyncContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "gpsync-agent")]
#[command(about = "Mirrors supervisor ports and tasks into the local workspace", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Supervisor gRPC endpoint (falls back to SUPERVISOR_ADDR)
    #[arg(long, global = true, default_value = "")]
    supervisor_addr: String,
    #[arg(long, global = true, default_value_t = false)]
    dev_mode: bool,
    /// Delay before reopening a failed or finished status stream
    #[arg(long, global = true, default_value_t = 1000)]
    backoff_ms: u64,
    #[arg(long, global = true, default_value = "")]
    log_dir: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Keep local terminals in step with supervisor tasks
    Run {
        #[arg(long, default_value = "")]
        tmux_session: String,
        /// Socket of the tmux server (falls back to GPSYNC_TMUX_SOCKET)
        #[arg(long, default_value = "")]
        tmux_socket: String,
        #[arg(long, default_value_t = 500)]
        terminal_poll_ms: u64,
    },
    /// Print the external port of a forwarded local port
    ResolvePort {
        port: u32,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Print the forwarded ports once they are known
    Ports {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the supervisor tasks once they are known
    Tasks {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut flags = ConfigFlags {
        supervisor_addr: cli.global.supervisor_addr,
        dev_mode: cli.global.dev_mode,
        backoff_ms: cli.global.backoff_ms,
        terminal_poll_ms: 500,
        log_dir: cli.global.log_dir,
        ..ConfigFlags::default()
    };
    let label = match &cli.command {
        Commands::Run {
            tmux_session,
            tmux_socket,
            terminal_poll_ms,
        } => {
            flags.tmux_session = tmux_session.clone();
            flags.tmux_socket = tmux_socket.clone();
            flags.terminal_poll_ms = *terminal_poll_ms;
            "run"
        }
        Commands::ResolvePort { .. } => "resolve-port",
        Commands::Ports { .. } => "ports",
        Commands::Tasks { .. } => "tasks",
    };
    let config = AgentConfig::resolve(flags);
    let _log_guard = init_logging(&config, label);

    let client = SupervisorClient::connect(&config.supervisor_addr)
        .with_context(|| format!("cannot reach supervisor at {}", config.supervisor_addr))?;
    info!(
        event = "agent_start",
        command = label,
        supervisor = %config.supervisor_addr,
        dev_mode = config.dev_mode
    );

    match cli.command {
        Commands::Run { .. } => run(config, client).await,
        Commands::ResolvePort { port, timeout_secs } => {
            resolve_port(&config, client, port, timeout_secs).await
        }
        Commands::Ports { json } => print_ports(&config, client, json).await,
        Commands::Tasks { json } => print_tasks(&config, client, json).await,
    }
}

async fn run(config: AgentConfig, client: SupervisorClient) -> Result<()> {
    let context = SyncContext::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let host: Arc<dyn TerminalHost> = Arc::new(
        TmuxHost::new(config.tmux_session.clone()).with_socket(config.tmux_socket.clone()),
    );
    // Subscribe before the tasks stream opens so the first batch is not missed.
    let updates = context.tasks.subscribe();
    let closed = spawn_close_poller(host.clone(), config.terminal_poll, shutdown_rx.clone());
    let reconciler = TerminalReconciler::new(
        context.tasks.clone(),
        host,
        Arc::new(ProcFs::new()),
        Arc::new(client.clone()),
        AgentBinary::new(&config.agent_bin, &config.legacy_agent_bin, config.dev_mode),
    );
    let reconciler_task = tokio::spawn(async move {
        reconciler.run(updates, closed, shutdown_rx).await;
    });

    let ports_watcher = watch_ports(client.clone(), context.ports.clone(), config.backoff);
    let tasks_watcher = watch_tasks(client, context.tasks.clone(), config.backoff);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!(event = "agent_shutdown");

    ports_watcher.shutdown().await;
    tasks_watcher.shutdown().await;
    let _ = shutdown_tx.send(true);
    if let Err(err) = reconciler_task.await {
        error!(event = "reconciler_join_error", error = %err);
    }
    Ok(())
}

async fn resolve_port(
    config: &AgentConfig,
    client: SupervisorClient,
    port: u32,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let context = SyncContext::new();
    let watcher = watch_ports(client, context.ports.clone(), config.backoff);
    let resolver = ExternalPortResolver::new(context.ports.clone());

    let resolved = match timeout_secs {
        Some(secs) => resolver
            .resolve_within(port, Duration::from_secs(secs))
            .await
            .with_context(|| format!("port {port} was not resolved within {secs}s"))?,
        None => resolver.resolve(port).await,
    };
    watcher.shutdown().await;
    println!("{resolved}");
    Ok(())
}

async fn print_ports(config: &AgentConfig, client: SupervisorClient, json: bool) -> Result<()> {
    let context = SyncContext::new();
    let mut changes = context.ports.subscribe();
    let watcher = watch_ports(client, context.ports.clone(), config.backoff);
    changes
        .changed()
        .await
        .context("ports registry dropped before the first update")?;
    watcher.shutdown().await;

    if json {
        let ports = context.ports.snapshot();
        println!("{}", serde_json::to_string_pretty(&ports)?);
    } else {
        print!("{}", view::render_tree(&context.ports));
    }
    Ok(())
}

async fn print_tasks(config: &AgentConfig, client: SupervisorClient, json: bool) -> Result<()> {
    let context = SyncContext::new();
    let watcher = watch_tasks(client, context.tasks.clone(), config.backoff);
    context.tasks.first_batch().await;
    watcher.shutdown().await;

    let tasks = context.tasks.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    for task in tasks {
        match &task.presentation_name {
            Some(name) => println!("{}\t{}\t{}\t{name}", task.id, task.state, task.terminal),
            None => println!("{}\t{}\t{}", task.id, task.state, task.terminal),
        }
    }
    Ok(())
}
