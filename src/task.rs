//! Tasks and the shared task queue.
//!
//! A task is a `(command, label)` pair. The queue hands tasks to whichever
//! worker asks first and tracks how many are not yet done, so the manager
//! can wait for full drain. Delivery is at least once: a task is marked
//! done only after some node reports a definitive success, and a failed
//! attempt puts the task back for any other worker to pick up.

use std::fs::File;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Notify;
use void::Void;

use crate::error::SweepError;
use crate::serde::string_or_mapping;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub command: String,
    /// Caller-supplied identifier attached to every log event of this task.
    pub label: String,
}

impl Task {
    pub fn new(command: String, label: String) -> Self {
        Self { command, label }
    }
}

#[derive(Debug, Deserialize)]
struct TaskSpec(#[serde(deserialize_with = "string_or_mapping")] TaskSpecInner);

#[derive(Debug, Deserialize)]
struct TaskSpecInner {
    command: String,
    #[serde(default)]
    label: Option<String>,
}

impl FromStr for TaskSpecInner {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            command: s.to_string(),
            label: None,
        })
    }
}

/// Reads a queue file: a YAML list of bare command strings or
/// `{command, label}` mappings. The label defaults to the command itself.
pub fn get_tasks(queue_file: &str) -> Result<Vec<Task>, SweepError> {
    let fd = File::open(queue_file)?;
    let specs: Vec<TaskSpec> = serde_yaml::from_reader(fd)?;
    Ok(specs
        .into_iter()
        .map(|TaskSpec(spec)| {
            let label = spec.label.unwrap_or_else(|| spec.command.clone());
            Task::new(spec.command, label)
        })
        .collect())
}

/// MPMC task queue with drain tracking.
pub struct TaskQueue {
    tx: flume::Sender<Task>,
    rx: flume::Receiver<Task>,
    /// Tasks put but not yet marked done. Requeues do not change this.
    outstanding: AtomicUsize,
    drained: Notify,
}

impl TaskQueue {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Arc<Self> {
        let (tx, rx) = flume::unbounded();
        Arc::new(Self {
            tx,
            rx,
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    /// Enqueues a new task. Pair every `put` with exactly one `task_done`.
    pub fn put(&self, task: Task) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.tx.send(task).expect("task queue receiver dropped");
    }

    /// Puts a failed task back for another attempt. Does not touch the
    /// outstanding count, which still covers the original `put`.
    pub fn requeue(&self, task: Task) {
        self.tx.send(task).expect("task queue receiver dropped");
    }

    /// Non-blocking pop.
    pub fn try_get(&self) -> Option<Task> {
        self.rx.try_recv().ok()
    }

    /// Pops a task, waiting at most `wait` for one to arrive.
    pub async fn get_timeout(&self, wait: std::time::Duration) -> Option<Task> {
        tokio::time::timeout(wait, self.rx.recv_async())
            .await
            .ok()?
            .ok()
    }

    /// Marks one task permanently done.
    pub fn task_done(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Resolves once every task ever `put` has been marked done.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}
