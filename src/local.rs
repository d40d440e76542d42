//! Local compute node.
//!
//! Runs commands on the local machine through the same `ComputeNode`
//! contract as the SSH node, which keeps single-machine sweeps and the
//! scheduling loop's tests free of any network dependency. The GPU list
//! comes from the target's `gpus` parameter instead of a remote probe.

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::Settings;
use crate::events::{LogEvent, RunStatus, WarnLimiter};
use crate::node::{ComputeNode, OutputMonitor};
use crate::target::NodeDetails;

pub struct LocalNode {
    name: String,
    details: NodeDetails,
    settings: Settings,
    free_gpus: Vec<u32>,
    opened: bool,
    log_tx: flume::Sender<LogEvent>,
    warn: WarnLimiter,
}

impl LocalNode {
    pub fn new(
        name: String,
        details: NodeDetails,
        settings: Settings,
        log_tx: flume::Sender<LogEvent>,
    ) -> Self {
        let warn = WarnLimiter::new(settings.warn_interval);
        Self {
            name,
            details,
            settings,
            free_gpus: Vec::new(),
            opened: false,
            log_tx,
            warn,
        }
    }

    /// Parses the `gpus` target parameter, e.g. `"0,1,3"`. Targets without
    /// one get a single slot 0 so plain CPU commands still run one at a time.
    fn configured_gpus(&self) -> Vec<u32> {
        match self.details.params.get("gpus") {
            Some(raw) => raw
                .split(',')
                .filter_map(|part| match part.trim().parse() {
                    Ok(idx) => Some(idx),
                    Err(_) => {
                        tracing::warn!(node = %self.name, part, "ignoring unparsable GPU index");
                        None
                    }
                })
                .collect(),
            None => vec![0],
        }
    }

    fn push_status(&self, label: &str, status: RunStatus, message: Option<String>) {
        let _ = self.log_tx.send(LogEvent::status(
            &self.details.address,
            label,
            status,
            message,
        ));
    }
}

#[async_trait]
impl ComputeNode for LocalNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> &str {
        &self.details.address
    }

    async fn open_connection(&mut self) -> bool {
        if !self.opened {
            self.free_gpus = self.configured_gpus();
            self.opened = true;
        } else if self.free_gpus.is_empty() {
            // Reconnection after cooldown restores the configured slots;
            // there is no remote state to re-probe locally.
            self.free_gpus = self.configured_gpus();
        }
        !self.free_gpus.is_empty()
    }

    async fn run(&mut self, command: &str, label: &str) -> bool {
        let gpu = match self.free_gpus.pop() {
            Some(gpu) => gpu,
            None => {
                self.push_status(label, RunStatus::Failed, Some("no free GPU".into()));
                return false;
            }
        };

        self.push_status(label, RunStatus::Running, None);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env("CUDA_VISIBLE_DEVICES", gpu.to_string())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(error) => {
                self.push_status(
                    label,
                    RunStatus::Failed,
                    Some(format!("failed to spawn local command: {}", error)),
                );
                return false;
            }
        };

        let stdout = child.stdout.take().unwrap();
        let mut monitor = OutputMonitor::new(
            &self.details.address,
            label,
            &self.log_tx,
            &mut self.warn,
            self.settings.read_timeout,
            self.settings.run_timeout,
        );
        let outcome = monitor.follow(stdout).await;

        let failure = match outcome.failure {
            Some(reason) => {
                let _ = child.kill().await;
                Some(reason)
            }
            None => {
                let mut stderr_buf = String::new();
                if let Some(mut stderr) = child.stderr.take() {
                    use tokio::io::AsyncReadExt;
                    let _ = timeout(
                        self.settings.read_timeout,
                        stderr.read_to_string(&mut stderr_buf),
                    )
                    .await;
                }
                match timeout(self.settings.run_timeout, child.wait()).await {
                    Ok(Ok(status)) if status.success() => {
                        if stderr_buf.trim().is_empty() {
                            None
                        } else {
                            Some(format!("stderr not empty: {}", stderr_buf.trim()))
                        }
                    }
                    Ok(Ok(status)) => Some(format!("exited with {}", status)),
                    Ok(Err(error)) => Some(format!("wait failed: {}", error)),
                    Err(_) => {
                        let _ = child.kill().await;
                        Some("process did not exit after stdout closed".into())
                    }
                }
            }
        };

        match failure {
            Some(reason) => {
                self.push_status(label, RunStatus::Failed, Some(reason));
                false
            }
            None => {
                self.free_gpus.push(gpu);
                self.push_status(label, RunStatus::Completed, None);
                true
            }
        }
    }

    fn free_capacity(&self) -> usize {
        self.free_gpus.len()
    }

    async fn close(&mut self) {
        self.free_gpus.clear();
    }
}
