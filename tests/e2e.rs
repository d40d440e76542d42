//! End-to-end tests for the sweep scheduling loop.
//!
//! A mock node factory drives the manager through connection failures,
//! run failures, cooldowns, and drops without opening any real
//! connections. Node behavior is scripted per target name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::{sleep, Duration, Instant};

use gridsweep::{
    ComputeNode, ConnectionPool, LogEvent, NodeDetails, NodeFactory, Payload, RunManager,
    RunStatus, Settings, SweepError, Target, Task, TaskQueue,
};

/// Scripted behavior for one target. The last entry of each sequence
/// repeats once the script runs out.
#[derive(Clone)]
struct NodeScript {
    connects: Vec<bool>,
    runs: Vec<bool>,
    capacity: usize,
}

impl NodeScript {
    fn reliable() -> Self {
        Self {
            connects: vec![true],
            runs: vec![true],
            capacity: 1,
        }
    }

    fn unreachable() -> Self {
        Self {
            connects: vec![false],
            runs: vec![],
            capacity: 0,
        }
    }
}

#[derive(Default)]
struct NodeRecord {
    connect_attempts: usize,
    connect_times: Vec<Instant>,
    run_attempts: usize,
    executed: Vec<String>,
    completed: Vec<String>,
}

struct MockState {
    scripts: HashMap<String, NodeScript>,
    records: Mutex<HashMap<String, NodeRecord>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    run_delay: Duration,
}

impl MockState {
    fn record<T>(&self, name: &str, f: impl FnOnce(&mut NodeRecord) -> T) -> T {
        let mut records = self.records.lock().unwrap();
        f(records.entry(name.to_string()).or_default())
    }

    fn connect_attempts(&self, name: &str) -> usize {
        self.record(name, |r| r.connect_attempts)
    }

    fn connect_times(&self, name: &str) -> Vec<Instant> {
        self.record(name, |r| r.connect_times.clone())
    }

    fn completed(&self, name: &str) -> Vec<String> {
        self.record(name, |r| r.completed.clone())
    }

    fn executed(&self, name: &str) -> Vec<String> {
        self.record(name, |r| r.executed.clone())
    }
}

struct MockNode {
    name: String,
    address: String,
    capacity: usize,
    state: Arc<MockState>,
    log_tx: flume::Sender<LogEvent>,
}

#[async_trait]
impl ComputeNode for MockNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn open_connection(&mut self) -> bool {
        let script = &self.state.scripts[&self.name];
        let attempt = self.state.record(&self.name, |r| {
            r.connect_attempts += 1;
            r.connect_times.push(Instant::now());
            r.connect_attempts - 1
        });
        let ok = script
            .connects
            .get(attempt)
            .or_else(|| script.connects.last())
            .copied()
            .unwrap_or(false);
        if ok {
            self.capacity = script.capacity;
        }
        ok && self.capacity > 0
    }

    async fn run(&mut self, command: &str, label: &str) -> bool {
        let script = &self.state.scripts[&self.name];
        let attempt = self.state.record(&self.name, |r| {
            r.run_attempts += 1;
            r.executed.push(command.to_string());
            r.run_attempts - 1
        });

        let _ = self
            .log_tx
            .send(LogEvent::status(&self.address, label, RunStatus::Running, None));
        let running = self.state.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_running.fetch_max(running, Ordering::SeqCst);
        sleep(self.state.run_delay).await;
        self.state.running.fetch_sub(1, Ordering::SeqCst);

        let ok = script
            .runs
            .get(attempt)
            .or_else(|| script.runs.last())
            .copied()
            .unwrap_or(false);
        if ok {
            self.state.record(&self.name, |r| r.completed.push(command.to_string()));
            let _ = self.log_tx.send(LogEvent::status(
                &self.address,
                label,
                RunStatus::Completed,
                None,
            ));
        } else {
            // A failed run costs the node its GPU, like the real nodes.
            self.capacity -= 1;
            let _ = self.log_tx.send(LogEvent::status(
                &self.address,
                label,
                RunStatus::Failed,
                Some("scripted failure".to_string()),
            ));
        }
        ok
    }

    fn free_capacity(&self) -> usize {
        self.capacity
    }

    async fn close(&mut self) {}
}

struct MockFactory {
    state: Arc<MockState>,
    log_tx: flume::Sender<LogEvent>,
}

impl NodeFactory for MockFactory {
    fn build(&self, target: &Target) -> Box<dyn ComputeNode> {
        Box::new(MockNode {
            name: target.name.clone(),
            address: target.details.address.clone(),
            capacity: 0,
            state: Arc::clone(&self.state),
            log_tx: self.log_tx.clone(),
        })
    }
}

struct Sweep {
    manager: RunManager,
    state: Arc<MockState>,
    log_rx: flume::Receiver<LogEvent>,
    tasks: Arc<TaskQueue>,
}

/// Settings with intervals short enough for tests that run in real time.
fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.pop_wait = Duration::from_millis(20);
    settings.retry_interval = Duration::from_millis(30);
    settings.retry_poll_interval = Duration::from_millis(10);
    settings
}

fn make_tasks(commands: &[&str]) -> Vec<Task> {
    commands
        .iter()
        .map(|c| Task::new(c.to_string(), c.to_string()))
        .collect()
}

fn build_sweep(
    scripts: Vec<(&str, NodeScript)>,
    tasks: Vec<Task>,
    settings: Settings,
    run_delay: Duration,
) -> Sweep {
    let targets: HashMap<String, NodeDetails> = scripts
        .iter()
        .map(|(name, _)| (name.to_string(), NodeDetails::new(name.to_string())))
        .collect();
    let state = Arc::new(MockState {
        scripts: scripts
            .into_iter()
            .map(|(name, script)| (name.to_string(), script))
            .collect(),
        records: Mutex::new(HashMap::new()),
        running: AtomicUsize::new(0),
        max_running: AtomicUsize::new(0),
        run_delay,
    });

    let queue = TaskQueue::new();
    for task in tasks {
        queue.put(task);
    }

    let (log_tx, log_rx) = flume::unbounded();
    let factory = Arc::new(MockFactory {
        state: Arc::clone(&state),
        log_tx: log_tx.clone(),
    });
    let pool = Arc::new(ConnectionPool::new(Duration::from_secs(1)));
    let manager = RunManager::with_factory(
        settings,
        targets,
        Arc::clone(&queue),
        log_tx,
        factory,
        pool,
    );

    Sweep {
        manager,
        state,
        log_rx,
        tasks: queue,
    }
}

fn statuses_for(events: &[LogEvent], label: &str) -> Vec<RunStatus> {
    events
        .iter()
        .filter(|e| e.label == label)
        .filter_map(|e| match &e.payload {
            Payload::Status { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

// The baseline scenario: one flaky target is dropped permanently after a
// single connection failure, and the healthy target absorbs the task.
#[tokio::test]
async fn test_flaky_target_dropped_healthy_target_completes() {
    let mut settings = fast_settings();
    settings.max_retries = 1;
    let mut sweep = build_sweep(
        vec![("bad", NodeScript::unreachable()), ("good", NodeScript::reliable())],
        make_tasks(&["echo one"]),
        settings,
        Duration::from_millis(5),
    );

    sweep.manager.start_run().await.unwrap();

    assert_eq!(sweep.state.completed("good"), vec!["echo one"]);
    assert!(sweep.state.executed("bad").is_empty());
    // With a budget of one, a single failed attempt drops the target.
    assert_eq!(sweep.state.connect_attempts("bad"), 1);
    assert_eq!(sweep.tasks.outstanding(), 0);
}

// Task conservation: a failed attempt requeues the task, and it is marked
// done exactly once after a later attempt succeeds.
#[tokio::test]
async fn test_failed_run_is_retried_until_success() {
    let script = NodeScript {
        connects: vec![true],
        runs: vec![false, true],
        capacity: 2,
    };
    let mut sweep = build_sweep(
        vec![("node", script)],
        make_tasks(&["python train.py"]),
        fast_settings(),
        Duration::from_millis(5),
    );

    sweep.manager.start_run().await.unwrap();

    assert_eq!(sweep.state.executed("node").len(), 2);
    assert_eq!(sweep.state.completed("node").len(), 1);
    assert_eq!(sweep.tasks.outstanding(), 0);

    let events: Vec<LogEvent> = sweep.log_rx.try_iter().collect();
    assert_eq!(
        statuses_for(&events, "python train.py"),
        vec![
            RunStatus::Running,
            RunStatus::Failed,
            RunStatus::Running,
            RunStatus::Completed
        ]
    );
}

// Retry budget monotonicity: after max_retries consecutive connection
// failures a target never comes back, no matter how many cooldown cycles
// elapse afterwards.
#[tokio::test]
async fn test_exhausted_target_never_returns() {
    let mut settings = fast_settings();
    settings.max_retries = 3;
    let mut sweep = build_sweep(
        vec![("bad", NodeScript::unreachable()), ("good", NodeScript::reliable())],
        make_tasks(&["a", "b", "c", "d", "e"]),
        settings,
        Duration::from_millis(60),
    );

    sweep.manager.start_run().await.unwrap();

    // The sweep ran long enough for several cooldown cycles, so the bad
    // target burned its entire budget and no more.
    assert_eq!(sweep.state.connect_attempts("bad"), 3);
    assert_eq!(sweep.state.completed("good").len(), 5);
}

// Cooldown timing: a failed target is not retried before the retry
// interval has elapsed.
#[tokio::test(start_paused = true)]
async fn test_cooldown_delays_reconnection() {
    let script = NodeScript {
        connects: vec![false, true],
        runs: vec![true],
        capacity: 1,
    };
    let mut settings = fast_settings();
    settings.retry_interval = Duration::from_secs(450);
    settings.retry_poll_interval = Duration::from_secs(450);
    let mut sweep = build_sweep(
        vec![("node", script)],
        make_tasks(&["echo one"]),
        settings,
        Duration::from_millis(5),
    );

    sweep.manager.start_run().await.unwrap();

    let times = sweep.state.connect_times("node");
    assert_eq!(times.len(), 2);
    assert!(times[1].duration_since(times[0]) >= Duration::from_secs(450));
    assert_eq!(sweep.state.completed("node").len(), 1);
}

// Shutdown with an already-empty queue terminates cleanly and leaves no
// cached connections behind; repeated stop requests are harmless.
#[tokio::test]
async fn test_shutdown_with_empty_queue_is_clean() {
    let mut sweep = build_sweep(
        vec![("a", NodeScript::reliable()), ("b", NodeScript::reliable())],
        vec![],
        fast_settings(),
        Duration::from_millis(5),
    );

    let stop = sweep.manager.stop_handle();
    sweep.manager.start_run().await.unwrap();
    assert!(sweep.manager.connection_pool().is_empty().await);

    stop.request_stop();
    stop.request_stop();
}

// Worker concurrency is bounded by the configured maximum.
#[tokio::test]
async fn test_worker_count_is_bounded() {
    let mut settings = fast_settings();
    settings.max_workers = Some(2);
    let scripts = vec![
        ("a", NodeScript::reliable()),
        ("b", NodeScript::reliable()),
        ("c", NodeScript::reliable()),
        ("d", NodeScript::reliable()),
    ];
    let mut sweep = build_sweep(
        scripts,
        make_tasks(&["1", "2", "3", "4", "5", "6", "7", "8"]),
        settings,
        Duration::from_millis(20),
    );

    sweep.manager.start_run().await.unwrap();

    assert!(sweep.state.max_running.load(Ordering::SeqCst) <= 2);
    assert_eq!(sweep.tasks.outstanding(), 0);
}

// When every target exhausts its budget with tasks still pending, the
// sweep surfaces an explicit error instead of hanging.
#[tokio::test]
async fn test_all_targets_exhausted_surfaces_error() {
    let mut settings = fast_settings();
    settings.max_retries = 2;
    let mut sweep = build_sweep(
        vec![("bad", NodeScript::unreachable())],
        make_tasks(&["echo one"]),
        settings,
        Duration::from_millis(5),
    );

    let result = sweep.manager.start_run().await;
    match result {
        Err(SweepError::TargetsExhausted { pending }) => assert_eq!(pending, 1),
        other => panic!("expected TargetsExhausted, got {:?}", other.err()),
    }
    assert_eq!(sweep.state.connect_attempts("bad"), 2);
}

// Multiple reliable targets drain a queue without losing or duplicating
// any task.
#[tokio::test]
async fn test_tasks_distributed_across_targets() {
    let scripts = vec![("a", NodeScript::reliable()), ("b", NodeScript::reliable())];
    let commands = ["1", "2", "3", "4", "5", "6"];
    let mut sweep = build_sweep(
        scripts,
        make_tasks(&commands),
        fast_settings(),
        Duration::from_millis(10),
    );

    sweep.manager.start_run().await.unwrap();

    let mut all: Vec<String> = sweep
        .state
        .completed("a")
        .into_iter()
        .chain(sweep.state.completed("b"))
        .collect();
    all.sort();
    let expected: Vec<String> = commands.iter().map(|c| c.to_string()).collect();
    assert_eq!(all, expected);
}
