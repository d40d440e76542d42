//! Gridsweep: a GPU-aware multi-node SSH sweep runner.

// Serde helper module.
mod serde;
// Command line arguments and settings.
pub mod config;
// Bounded exponential backoff policy.
pub mod backoff;
// Error handling.
pub mod error;
// Log queue events and stdout classification.
pub mod events;
// Local process node.
pub mod local;
// Sweep manager: workers, retries, cooldown.
pub mod manager;
// Compute node interface and factory.
pub mod node;
// SSH connection pool.
pub mod pool;
// Free-GPU discovery.
pub mod probe;
// SSH-backed node.
pub mod ssh;
// Targets and target-file parsing.
pub mod target;
// Tasks and the shared task queue.
pub mod task;

pub use backoff::Backoff;
pub use config::{Config, Settings};
pub use error::SweepError;
pub use events::{classify, Classified, LogEvent, Payload, RunStatus};
pub use local::LocalNode;
pub use manager::{RunManager, StopHandle};
pub use node::{ComputeNode, DefaultNodeFactory, NodeFactory};
pub use pool::{Channel, ConnectionPool};
pub use probe::{parse_gpu_info, PROBE_SCRIPT};
pub use ssh::SshNode;
pub use target::{get_targets, NodeDetails, NodeKind, Target};
pub use task::{get_tasks, Task, TaskQueue};
