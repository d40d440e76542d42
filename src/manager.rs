//! Sweep manager.
//!
//! Owns the target pool and a bounded set of workers, dispatches queued
//! tasks to whichever node is available, and recovers from node failures
//! without losing tasks. A target is always in exactly one place: the
//! priority queue (available), the cooldown map (unavailable), or held by
//! a worker. Tasks are delivered at least once; a task is only marked
//! done after a node reports success.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Duration, Instant, MissedTickBehavior};

use crate::config::Settings;
use crate::error::SweepError;
use crate::events::{LogEvent, RunStatus};
use crate::node::{DefaultNodeFactory, NodeFactory};
use crate::pool::ConnectionPool;
use crate::target::{NodeDetails, Target};
use crate::task::TaskQueue;

/// Shared sweep state: the single place targets move through.
struct SweepState {
    available: Mutex<BinaryHeap<Target>>,
    available_notify: Notify,
    /// Targets under retry cooldown: name → (failure time, target).
    /// The stored target carries its remaining retries, so a requeued
    /// target resumes with the budget it had left, never a fresh one.
    unavailable: Mutex<HashMap<String, (Instant, Target)>>,
    /// Targets not yet permanently dropped (available + cooling + held).
    live: AtomicUsize,
    stop: AtomicBool,
    stop_notify: Notify,
    exhausted: AtomicBool,
    exhausted_notify: Notify,
}

impl SweepState {
    fn new() -> Self {
        Self {
            available: Mutex::new(BinaryHeap::new()),
            available_notify: Notify::new(),
            unavailable: Mutex::new(HashMap::new()),
            live: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            stop_notify: Notify::new(),
            exhausted: AtomicBool::new(false),
            exhausted_notify: Notify::new(),
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        self.available_notify.notify_waiters();
    }

    fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    async fn seed(&self, targets: &HashMap<String, NodeDetails>, retries: u32) {
        let mut heap = self.available.lock().await;
        for (name, details) in targets {
            heap.push(Target::new(name.clone(), details.clone(), retries));
        }
        self.live.store(targets.len(), Ordering::SeqCst);
    }

    async fn push_target(&self, target: Target) {
        self.available.lock().await.push(target);
        self.available_notify.notify_one();
    }

    /// Pops the healthiest available target, waiting at most `wait` for
    /// one to show up.
    async fn pop_target(&self, wait: Duration) -> Option<Target> {
        if let Some(target) = self.available.lock().await.pop() {
            return Some(target);
        }
        let notified = self.available_notify.notified();
        if self.stopped() {
            return None;
        }
        let _ = timeout(wait, notified).await;
        self.available.lock().await.pop()
    }

    /// Records a connection failure. Targets with budget left go to the
    /// cooldown map; exhausted targets are dropped for good, and if that
    /// was the last live target while tasks remain, the sweep is declared
    /// starved.
    async fn fail_target(
        &self,
        mut target: Target,
        tasks: &TaskQueue,
        log_tx: &flume::Sender<LogEvent>,
    ) {
        target.retries = target.retries.saturating_sub(1);
        if target.retries == 0 {
            tracing::warn!(node = %target, "retry budget exhausted, dropping target permanently");
            let _ = log_tx.send(LogEvent::status(
                &target.details.address,
                "connect",
                RunStatus::Failed,
                Some(format!("target {} dropped after repeated failures", target.name)),
            ));
            let remaining = self.live.fetch_sub(1, Ordering::SeqCst) - 1;
            if remaining == 0 && tasks.outstanding() > 0 {
                self.exhausted.store(true, Ordering::SeqCst);
                self.exhausted_notify.notify_waiters();
            }
        } else {
            tracing::warn!(
                node = %target,
                retries_left = target.retries,
                "connection failed, target moved to cooldown"
            );
            self.unavailable
                .lock()
                .await
                .insert(target.name.clone(), (Instant::now(), target));
        }
    }

    /// Moves every cooled-down target back into the priority queue and
    /// wakes waiting workers.
    async fn requeue_cooled(&self, cooldown: Duration) {
        let now = Instant::now();
        let ready: Vec<Target> = {
            let mut map = self.unavailable.lock().await;
            let due: Vec<String> = map
                .iter()
                .filter(|(_, (since, _))| now.duration_since(*since) >= cooldown)
                .map(|(name, _)| name.clone())
                .collect();
            due.into_iter()
                .filter_map(|name| map.remove(&name))
                .map(|(_, target)| target)
                .collect()
        };
        if ready.is_empty() {
            return;
        }
        let mut heap = self.available.lock().await;
        for target in ready {
            tracing::info!(node = %target, "cooldown elapsed, target requeued");
            heap.push(target);
        }
        drop(heap);
        self.available_notify.notify_waiters();
    }

    async fn stop_wait(&self) {
        loop {
            let notified = self.stop_notify.notified();
            if self.stopped() {
                return;
            }
            notified.await;
        }
    }

    async fn exhausted_wait(&self) {
        loop {
            let notified = self.exhausted_notify.notified();
            if self.exhausted.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

pub struct RunManager {
    settings: Settings,
    targets: HashMap<String, NodeDetails>,
    tasks: Arc<TaskQueue>,
    log_tx: flume::Sender<LogEvent>,
    factory: Arc<dyn NodeFactory>,
    pool: Arc<ConnectionPool>,
    state: Arc<SweepState>,
}

/// Cloneable handle that cancels the sweep, e.g. from a ctrl-c handler.
#[derive(Clone)]
pub struct StopHandle(Arc<SweepState>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.request_stop();
    }
}

impl RunManager {
    pub fn new(
        settings: Settings,
        targets: HashMap<String, NodeDetails>,
        tasks: Arc<TaskQueue>,
        log_tx: flume::Sender<LogEvent>,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(settings.connect_timeout));
        let factory = Arc::new(DefaultNodeFactory::new(
            settings.clone(),
            Arc::clone(&pool),
            log_tx.clone(),
        ));
        Self::with_factory(settings, targets, tasks, log_tx, factory, pool)
    }

    /// Constructor with an injected node factory, used to exercise the
    /// scheduling loop without opening real connections.
    pub fn with_factory(
        settings: Settings,
        targets: HashMap<String, NodeDetails>,
        tasks: Arc<TaskQueue>,
        log_tx: flume::Sender<LogEvent>,
        factory: Arc<dyn NodeFactory>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            settings,
            targets,
            tasks,
            log_tx,
            factory,
            pool,
            state: Arc::new(SweepState::new()),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.state))
    }

    pub fn connection_pool(&self) -> Arc<ConnectionPool> {
        Arc::clone(&self.pool)
    }

    /// Runs the sweep to completion: seeds the target queue, spawns the
    /// retry sweep and the workers, and blocks until every task is done.
    /// Teardown (stop signal, worker join, retry-sweep cancel, connection
    /// cleanup) runs on every exit path.
    pub async fn start_run(&mut self) -> Result<(), SweepError> {
        let pending = self.tasks.outstanding();
        if self.targets.is_empty() {
            if pending > 0 {
                return Err(SweepError::TargetsExhausted { pending });
            }
            return Ok(());
        }

        self.state.seed(&self.targets, self.settings.max_retries).await;

        let retry_task = {
            let state = Arc::clone(&self.state);
            let poll = self.settings.retry_poll_interval;
            let cooldown = self.settings.retry_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if state.stopped() {
                        break;
                    }
                    state.requeue_cooled(cooldown).await;
                }
            })
        };

        let worker_count = self
            .settings
            .max_workers
            .unwrap_or(self.targets.len())
            .min(self.targets.len())
            .max(1);
        tracing::info!(
            targets = self.targets.len(),
            workers = worker_count,
            tasks = pending,
            "starting sweep"
        );
        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            workers.push(tokio::spawn(worker_loop(
                id,
                Arc::clone(&self.state),
                Arc::clone(&self.factory),
                Arc::clone(&self.tasks),
                self.settings.clone(),
                self.log_tx.clone(),
            )));
        }

        let result = tokio::select! {
            biased;
            _ = self.tasks.join() => Ok(()),
            _ = self.state.exhausted_wait() => Err(SweepError::TargetsExhausted {
                pending: self.tasks.outstanding(),
            }),
            _ = self.state.stop_wait() => {
                if self.tasks.outstanding() == 0 {
                    Ok(())
                } else {
                    Err(SweepError::Interrupted)
                }
            }
        };

        self.state.request_stop();
        join_all(workers).await;
        retry_task.abort();
        let _ = retry_task.await;
        self.pool.close_all().await;
        match &result {
            Ok(()) => tracing::info!("sweep complete"),
            Err(error) => tracing::error!(%error, "sweep ended early"),
        }
        result
    }
}

async fn worker_loop(
    id: usize,
    state: Arc<SweepState>,
    factory: Arc<dyn NodeFactory>,
    tasks: Arc<TaskQueue>,
    settings: Settings,
    log_tx: flume::Sender<LogEvent>,
) {
    loop {
        if state.stopped() {
            break;
        }
        if tasks.outstanding() == 0 {
            break;
        }
        let target = match state.pop_target(settings.pop_wait).await {
            Some(target) => target,
            None => {
                if state.live() == 0 {
                    break;
                }
                continue;
            }
        };

        let mut node = factory.build(&target);
        if !node.open_connection().await {
            state.fail_target(target, &tasks, &log_tx).await;
            continue;
        }
        tracing::debug!(worker = id, node = %target, "worker attached to target");

        let mut capacity_lost = false;
        while !state.stopped() {
            if node.free_capacity() == 0 {
                capacity_lost = true;
                break;
            }
            let task = match tasks.get_timeout(settings.pop_wait).await {
                Some(task) => task,
                None => {
                    if tasks.outstanding() == 0 {
                        break;
                    }
                    // Tasks are in flight elsewhere and may be requeued;
                    // keep the node attached and wait for one.
                    continue;
                }
            };
            if node.run(&task.command, &task.label).await {
                tasks.task_done();
            } else {
                tasks.requeue(task);
            }
        }

        node.close().await;
        if capacity_lost {
            // A node that burned through its GPUs goes through the same
            // cooldown path as a connect failure; reconnection re-probes.
            state.fail_target(target, &tasks, &log_tx).await;
            continue;
        }
        if tasks.outstanding() > 0 {
            state.push_target(target).await;
        } else {
            break;
        }
    }
    tracing::debug!(worker = id, "worker exiting");
}
