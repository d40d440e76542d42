//! Log queue events and stdout line classification.
//!
//! Nodes push every line they read onto the log queue as a raw entry, and
//! additionally push a structured event when the line matches one of the
//! known markers. The consumer side of the queue is not part of the core.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};

/// Marker printed by the GPU probe script.
pub const GPU_INFO_MARKER: &str = "[[GPU INFO]]";
/// Marker for a training progress line.
pub const TRAIN_MARKER: &str = "[[LOG_ACCURACY TRAIN]]";
/// Marker for a test accuracy line.
pub const TEST_MARKER: &str = "[[LOG_ACCURACY TEST]]";
/// First line of every wrapped remote command: the remote shell PID.
pub const PID_MARKER: &str = "[[SWEEP PID]]";

/// A line containing any of these substrings fails the run outright.
pub const FAILURE_SENTINELS: &[&str] = &[
    "RuntimeError",
    "Traceback (most recent call last)",
    "CUDA error",
    "CUDA out of memory",
    "Segmentation fault",
    "Killed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Task lifecycle event.
    Status {
        status: RunStatus,
        message: Option<String>,
    },
    /// Parsed training progress.
    Progress {
        elapsed: f64,
        losses: HashMap<String, f64>,
        completed: u64,
    },
    /// Parsed test accuracy.
    TestAccuracy { test_acc: f64 },
    /// Unmodified output line.
    Raw { line: String },
}

/// One entry on the log queue: a payload tagged with the node address and
/// the caller-supplied task label.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub payload: Payload,
    pub node: String,
    pub label: String,
}

impl LogEvent {
    pub fn status(node: &str, label: &str, status: RunStatus, message: Option<String>) -> Self {
        Self {
            payload: Payload::Status { status, message },
            node: node.to_string(),
            label: label.to_string(),
        }
    }

    pub fn raw(node: &str, label: &str, line: &str) -> Self {
        Self {
            payload: Payload::Raw {
                line: line.to_string(),
            },
            node: node.to_string(),
            label: label.to_string(),
        }
    }
}

/// Outcome of classifying one stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Progress {
        elapsed: f64,
        losses: HashMap<String, f64>,
        completed: u64,
    },
    TestAccuracy(f64),
    /// The sentinel substring that matched.
    Failure(&'static str),
}

/// Classifies a single stdout line. Returns `None` for lines that carry no
/// recognized marker; those are still forwarded raw by the caller.
pub fn classify(line: &str) -> Option<Classified> {
    if let Some(rest) = line.split_once(TRAIN_MARKER).map(|(_, r)| r) {
        return parse_progress(rest);
    }
    if let Some(rest) = line.split_once(TEST_MARKER).map(|(_, r)| r) {
        let value = rest.trim().trim_start_matches(':').trim();
        return value.parse().ok().map(Classified::TestAccuracy);
    }
    FAILURE_SENTINELS
        .iter()
        .copied()
        .find(|sentinel| line.contains(sentinel))
        .map(Classified::Failure)
}

/// Parses `Elapsed: <f>; Losses: <k>: <v>[, <k>: <v>]*; Step: <n>`.
/// Elapsed and Step are required; a malformed line classifies as nothing.
fn parse_progress(rest: &str) -> Option<Classified> {
    let mut elapsed = None;
    let mut losses = HashMap::new();
    let mut completed = None;
    for segment in rest.split(';') {
        let segment = segment.trim();
        if let Some(value) = segment.strip_prefix("Elapsed:") {
            elapsed = value.trim().parse().ok();
        } else if let Some(value) = segment.strip_prefix("Losses:") {
            for pair in value.split(',') {
                if let Some((key, value)) = pair.split_once(':') {
                    if let Ok(value) = value.trim().parse() {
                        losses.insert(key.trim().to_string(), value);
                    }
                }
            }
        } else if let Some(value) = segment.strip_prefix("Step:") {
            completed = value.trim().parse().ok();
        }
    }
    Some(Classified::Progress {
        elapsed: elapsed?,
        losses,
        completed: completed?,
    })
}

/// Rate limiter for repeated warnings about the same (label, message) pair.
/// Long-running streams tend to repeat the same complaint every read.
pub struct WarnLimiter {
    interval: Duration,
    last: HashMap<(String, String), Instant>,
}

impl WarnLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: HashMap::new(),
        }
    }

    /// Returns true at most once per interval for a given pair.
    pub fn should_emit(&mut self, label: &str, message: &str) -> bool {
        let now = Instant::now();
        let key = (label.to_string(), message.to_string());
        match self.last.get(&key) {
            Some(&emitted) if now.duration_since(emitted) < self.interval => false,
            _ => {
                self.last.insert(key, now);
                true
            }
        }
    }
}
