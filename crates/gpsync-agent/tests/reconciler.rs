use async_trait::async_trait;
use gpsync_agent::process::ProcessInspector;
use gpsync_agent::supervisor::{RemoteTerminals, SupervisorError};
use gpsync_agent::terminal::{HostError, TerminalHost, TerminalInfo, TerminalSpec};
use gpsync_agent::{AgentBinary, Reconciled, TerminalReconciler};
use gpsync_core::{TaskRegistry, TaskState, TaskStatus, TASK_ID_ENV};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const AGENT_BIN: &str = "/.supervisor/supervisor";

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostCall {
    Create { name: Option<String>, task_id: Option<String> },
    Show { id: String, preserve_focus: bool },
    SendText { id: String, text: String, add_newline: bool },
    Dispose { id: String },
}

#[derive(Default)]
struct FakeHost {
    terminals: Mutex<Vec<TerminalInfo>>,
    calls: Mutex<Vec<HostCall>>,
    broken: Mutex<HashSet<String>>,
    next_id: Mutex<u32>,
}

impl FakeHost {
    fn add_terminal(&self, id: &str, task_id: Option<&str>, pid: Option<u32>) {
        let env = task_id
            .map(|task_id| BTreeMap::from([(TASK_ID_ENV.to_string(), task_id.to_string())]))
            .unwrap_or_default();
        self.terminals.lock().unwrap().push(TerminalInfo {
            id: id.to_string(),
            name: id.to_string(),
            pid,
            env,
        });
    }

    /// Makes every write to terminal `id` fail.
    fn break_terminal(&self, id: &str) {
        self.broken.lock().unwrap().insert(id.to_string());
    }

    fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: HostCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, id: &str) -> Result<(), HostError> {
        if self.broken.lock().unwrap().contains(id) {
            return Err(HostError::Command {
                command: format!("write {id}"),
                status: "exit status: 1".to_string(),
                stderr: "broken terminal".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TerminalHost for FakeHost {
    async fn list_terminals(&self) -> Result<Vec<TerminalInfo>, HostError> {
        Ok(self.terminals.lock().unwrap().clone())
    }

    async fn create_terminal(&self, spec: &TerminalSpec) -> Result<TerminalInfo, HostError> {
        let id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            *next
        };
        let info = TerminalInfo {
            id: format!("@{id}"),
            name: spec.name.clone().unwrap_or_default(),
            pid: Some(1000 + id),
            env: spec.env.clone(),
        };
        self.record(HostCall::Create {
            name: spec.name.clone(),
            task_id: spec.env.get(TASK_ID_ENV).cloned(),
        });
        self.terminals.lock().unwrap().push(info.clone());
        Ok(info)
    }

    async fn show_terminal(&self, id: &str, preserve_focus: bool) -> Result<(), HostError> {
        self.record(HostCall::Show {
            id: id.to_string(),
            preserve_focus,
        });
        Ok(())
    }

    async fn send_text(&self, id: &str, text: &str, add_newline: bool) -> Result<(), HostError> {
        self.check(id)?;
        self.record(HostCall::SendText {
            id: id.to_string(),
            text: text.to_string(),
            add_newline,
        });
        Ok(())
    }

    async fn dispose_terminal(&self, id: &str) -> Result<(), HostError> {
        self.check(id)?;
        self.record(HostCall::Dispose { id: id.to_string() });
        self.terminals.lock().unwrap().retain(|terminal| terminal.id != id);
        Ok(())
    }
}

#[derive(Default)]
struct FakeInspector {
    children: Mutex<HashMap<u32, Vec<String>>>,
}

impl FakeInspector {
    fn set_children(&self, pid: u32, children: &[&str]) {
        self.children
            .lock()
            .unwrap()
            .insert(pid, children.iter().map(|name| name.to_string()).collect());
    }
}

#[async_trait]
impl ProcessInspector for FakeInspector {
    async fn child_commands(&self, pid: u32) -> io::Result<Vec<String>> {
        Ok(self
            .children
            .lock()
            .unwrap()
            .get(&pid)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct FakeRemote {
    closed: Mutex<Vec<String>>,
    fail: bool,
}

#[async_trait]
impl RemoteTerminals for FakeRemote {
    async fn close_terminal(&self, alias: &str) -> Result<(), SupervisorError> {
        self.closed.lock().unwrap().push(alias.to_string());
        if self.fail {
            return Err(tonic::Status::unavailable("supervisor gone").into());
        }
        Ok(())
    }
}

struct Fixture {
    tasks: Arc<TaskRegistry>,
    host: Arc<FakeHost>,
    inspector: Arc<FakeInspector>,
    remote: Arc<FakeRemote>,
    reconciler: Arc<TerminalReconciler>,
}

fn fixture_with_remote(remote: FakeRemote) -> Fixture {
    let tasks = Arc::new(TaskRegistry::new());
    let host = Arc::new(FakeHost::default());
    let inspector = Arc::new(FakeInspector::default());
    let remote = Arc::new(remote);
    let reconciler = Arc::new(TerminalReconciler::new(
        tasks.clone(),
        host.clone(),
        inspector.clone(),
        remote.clone(),
        AgentBinary::new(AGENT_BIN, "/theia/supervisor", false),
    ));
    Fixture {
        tasks,
        host,
        inspector,
        remote,
        reconciler,
    }
}

fn fixture() -> Fixture {
    fixture_with_remote(FakeRemote::default())
}

fn task(id: &str, state: TaskState, alias: &str) -> TaskStatus {
    TaskStatus::new(id, state, alias)
}

fn attach_text(alias: &str) -> String {
    format!("{AGENT_BIN} terminal attach -ir {alias}")
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn initial_batch_creates_one_tagged_terminal_per_open_task() {
    let fx = fixture();
    fx.host.add_terminal("@9", Some("already"), Some(50));
    let batch = vec![
        task("t1", TaskState::Running, "term-1").with_presentation_name("build"),
        task("t2", TaskState::Opening, "term-2"),
        task("t3", TaskState::Closed, "term-3"),
        task("already", TaskState::Running, "term-4"),
    ];

    fx.reconciler.create_initial_terminals(&batch).await;

    let creates: Vec<_> = fx
        .host
        .calls()
        .into_iter()
        .filter(|call| matches!(call, HostCall::Create { .. }))
        .collect();
    assert_eq!(
        creates,
        vec![
            HostCall::Create {
                name: Some("build".to_string()),
                task_id: Some("t1".to_string()),
            },
            HostCall::Create {
                name: None,
                task_id: Some("t2".to_string()),
            },
        ]
    );
    assert!(fx.host.calls().contains(&HostCall::Show {
        id: "@1".to_string(),
        preserve_focus: false,
    }));
}

#[tokio::test]
async fn running_task_gets_attached_once() {
    let fx = fixture();
    fx.host.add_terminal("@1", Some("t1"), Some(100));
    let running = task("t1", TaskState::Running, "term-1");

    let outcome = fx.reconciler.reconcile_task(&running).await.unwrap();
    assert_eq!(outcome, Reconciled::Attached);
    assert_eq!(
        fx.host.calls(),
        vec![HostCall::SendText {
            id: "@1".to_string(),
            text: attach_text("term-1"),
            add_newline: true,
        }]
    );

    fx.inspector.set_children(100, &["supervisor"]);
    let outcome = fx.reconciler.reconcile_task(&running).await.unwrap();
    assert_eq!(outcome, Reconciled::AlreadyAttached);
    assert_eq!(fx.host.calls().len(), 1);
}

#[tokio::test]
async fn terminal_without_shell_is_left_alone() {
    let fx = fixture();
    fx.host.add_terminal("@1", Some("t1"), None);
    let outcome = fx
        .reconciler
        .reconcile_task(&task("t1", TaskState::Running, "term-1"))
        .await
        .unwrap();
    assert_eq!(outcome, Reconciled::AwaitingShell);
    assert!(fx.host.calls().is_empty());
}

#[tokio::test]
async fn closed_task_disposes_its_terminal_without_attaching() {
    let fx = fixture();
    fx.host.add_terminal("@1", Some("t1"), Some(100));

    let outcome = fx
        .reconciler
        .reconcile_task(&task("t1", TaskState::Closed, "term-1"))
        .await
        .unwrap();

    assert_eq!(outcome, Reconciled::Disposed);
    assert_eq!(
        fx.host.calls(),
        vec![HostCall::Dispose {
            id: "@1".to_string()
        }]
    );
    let outcome = fx
        .reconciler
        .reconcile_task(&task("t1", TaskState::Closed, "term-1"))
        .await
        .unwrap();
    assert_eq!(outcome, Reconciled::Unbound);
}

#[tokio::test]
async fn opening_and_unbound_tasks_are_skipped() {
    let fx = fixture();
    fx.host.add_terminal("@1", Some("t1"), Some(100));
    let outcomes = fx
        .reconciler
        .update_terminals(&[
            task("t1", TaskState::Opening, "term-1"),
            task("t2", TaskState::Running, "term-2"),
        ])
        .await;
    assert_eq!(
        outcomes,
        vec![Some(Reconciled::Skipped), Some(Reconciled::Unbound)]
    );
    assert!(fx.host.calls().is_empty());
}

#[tokio::test]
async fn one_failing_task_does_not_block_the_batch() {
    let fx = fixture();
    fx.host.add_terminal("@1", Some("t1"), Some(100));
    fx.host.add_terminal("@2", Some("t2"), Some(200));
    fx.host.break_terminal("@1");

    let outcomes = fx
        .reconciler
        .update_terminals(&[
            task("t1", TaskState::Running, "term-1"),
            task("t2", TaskState::Running, "term-2"),
        ])
        .await;

    assert_eq!(outcomes, vec![None, Some(Reconciled::Attached)]);
    assert_eq!(
        fx.host.calls(),
        vec![HostCall::SendText {
            id: "@2".to_string(),
            text: attach_text("term-2"),
            add_newline: true,
        }]
    );
}

#[tokio::test]
async fn closing_a_running_task_terminal_closes_the_remote_one() {
    let fx = fixture();
    fx.tasks.apply_update(vec![
        task("t1", TaskState::Running, "term-1"),
        task("t2", TaskState::Closed, "term-2"),
    ]);
    let info = |id: &str, task_id: Option<&str>| TerminalInfo {
        id: id.to_string(),
        name: id.to_string(),
        pid: Some(1),
        env: task_id
            .map(|task_id| BTreeMap::from([(TASK_ID_ENV.to_string(), task_id.to_string())]))
            .unwrap_or_default(),
    };

    assert!(fx.reconciler.handle_terminal_closed(&info("@1", Some("t1"))).await);
    assert!(!fx.reconciler.handle_terminal_closed(&info("@2", Some("t2"))).await);
    assert!(!fx.reconciler.handle_terminal_closed(&info("@3", None)).await);
    assert!(!fx.reconciler.handle_terminal_closed(&info("@4", Some("unknown"))).await);

    assert_eq!(*fx.remote.closed.lock().unwrap(), vec!["term-1".to_string()]);
}

#[tokio::test]
async fn remote_close_failure_is_not_retried() {
    let fx = fixture_with_remote(FakeRemote {
        fail: true,
        ..FakeRemote::default()
    });
    fx.tasks
        .apply_update(vec![task("t1", TaskState::Running, "term-1")]);
    let terminal = TerminalInfo {
        id: "@1".to_string(),
        name: "build".to_string(),
        pid: Some(1),
        env: BTreeMap::from([(TASK_ID_ENV.to_string(), "t1".to_string())]),
    };

    assert!(fx.reconciler.handle_terminal_closed(&terminal).await);
    assert_eq!(fx.remote.closed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn run_loop_follows_task_lifecycle() {
    let fx = fixture();
    let updates = fx.tasks.subscribe();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = fx.reconciler.clone();
    let runner = tokio::spawn(async move {
        reconciler.run(updates, closed_rx, shutdown_rx).await;
    });

    fx.tasks
        .apply_update(vec![task("t1", TaskState::Running, "term-1")]);
    let host = fx.host.clone();
    eventually(|| {
        host.calls().contains(&HostCall::SendText {
            id: "@1".to_string(),
            text: attach_text("term-1"),
            add_newline: true,
        })
    })
    .await;
    let creates = fx
        .host
        .calls()
        .iter()
        .filter(|call| matches!(call, HostCall::Create { .. }))
        .count();
    assert_eq!(creates, 1);

    let terminal = fx.host.list_terminals().await.unwrap().remove(0);
    closed_tx.send(terminal).unwrap();
    let remote = fx.remote.clone();
    eventually(|| remote.closed.lock().unwrap().len() == 1).await;

    fx.tasks
        .apply_update(vec![task("t1", TaskState::Closed, "term-1")]);
    let host = fx.host.clone();
    eventually(|| {
        host.calls().contains(&HostCall::Dispose {
            id: "@1".to_string(),
        })
    })
    .await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("reconciler stops on shutdown")
        .unwrap();
}

#[tokio::test]
async fn run_loop_stops_before_first_batch() {
    let fx = fixture();
    let updates = fx.tasks.subscribe();
    let (_closed_tx, closed_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = fx.reconciler.clone();
    let runner = tokio::spawn(async move {
        reconciler.run(updates, closed_rx, shutdown_rx).await;
    });

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("reconciler stops on shutdown")
        .unwrap();
    assert!(fx.host.calls().is_empty());
}
