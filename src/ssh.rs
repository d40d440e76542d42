//! SSH-backed compute node.
//!
//! Owns one control channel (command execution) and one data channel
//! (file transfer) to a single host, both leased from the sweep's
//! connection pool. Free GPUs are discovered at connect time by shipping
//! the probe script over the data channel and running it over the control
//! channel. Commands are wrapped so the remote PID is known, which lets a
//! hung run be terminated gracefully before it is killed.

use std::sync::Arc;

use async_trait::async_trait;
use openssh::{Session, Stdio};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout, Duration};

use crate::backoff::Backoff;
use crate::config::Settings;
use crate::error::SweepError;
use crate::events::{LogEvent, RunStatus, WarnLimiter};
use crate::node::{ComputeNode, OutputMonitor};
use crate::pool::{Channel, ConnectionPool};
use crate::probe::{parse_gpu_info, remote_script_path, PROBE_SCRIPT};
use crate::target::NodeDetails;

const PROBE_BACKOFF: Backoff = Backoff::new(
    4,
    Duration::from_secs(2),
    2.0,
    Duration::from_secs(30),
);

pub struct SshNode {
    name: String,
    details: NodeDetails,
    settings: Settings,
    pool: Arc<ConnectionPool>,
    control: Option<Arc<Session>>,
    data: Option<Arc<Session>>,
    free_gpus: Vec<u32>,
    log_tx: flume::Sender<LogEvent>,
    warn: WarnLimiter,
}

impl SshNode {
    pub fn new(
        name: String,
        details: NodeDetails,
        settings: Settings,
        pool: Arc<ConnectionPool>,
        log_tx: flume::Sender<LogEvent>,
    ) -> Self {
        let warn = WarnLimiter::new(settings.warn_interval);
        Self {
            name,
            details,
            settings,
            pool,
            control: None,
            data: None,
            free_gpus: Vec::new(),
            log_tx,
            warn,
        }
    }

    /// Leases live control and data channels from the pool, replacing any
    /// stale ones held from a previous attempt.
    async fn ensure_sessions(&mut self) -> Result<(Arc<Session>, Arc<Session>), openssh::Error> {
        let control = match self.control.take() {
            Some(session) if session.check().await.is_ok() => session,
            _ => self.pool.acquire(&self.details, Channel::Control).await?,
        };
        self.control = Some(Arc::clone(&control));
        let data = match self.data.take() {
            Some(session) if session.check().await.is_ok() => session,
            _ => self.pool.acquire(&self.details, Channel::Data).await?,
        };
        self.data = Some(Arc::clone(&data));
        Ok((control, data))
    }

    async fn discover_gpus(
        &self,
        control: &Session,
        data: &Session,
    ) -> Result<Vec<u32>, SweepError> {
        let path = remote_script_path(&self.name);
        let seed = self.name.bytes().fold(0u64, |acc, b| {
            acc.wrapping_mul(31).wrapping_add(u64::from(b))
        });
        let mut attempt = 0;
        let gpus = loop {
            match self.try_probe(control, data, &path).await {
                Ok(gpus) => break gpus,
                Err(error) => match PROBE_BACKOFF.delay_with_jitter(attempt, seed) {
                    Some(delay) => {
                        tracing::warn!(
                            node = %self.name,
                            %error,
                            attempt,
                            "GPU probe failed, backing off"
                        );
                        sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        self.remove_probe(control, &path).await;
                        return Err(error);
                    }
                },
            }
        };
        self.remove_probe(control, &path).await;
        Ok(gpus)
    }

    /// One probe round trip: ship the script, run it, parse its output.
    async fn try_probe(
        &self,
        control: &Session,
        data: &Session,
        path: &str,
    ) -> Result<Vec<u32>, SweepError> {
        let mut copy = data.command("sh");
        copy.arg("-c").raw_arg(format!("'cat > {}'", path));
        copy.stdin(Stdio::piped());
        copy.stdout(Stdio::null());
        copy.stderr(Stdio::null());
        let mut child = copy.spawn().await?;
        let mut stdin = child.stdin().take().unwrap();
        stdin.write_all(PROBE_SCRIPT.as_bytes()).await?;
        stdin.shutdown().await?;
        drop(stdin);
        let status = timeout(self.settings.probe_timeout, child.wait())
            .await
            .map_err(|_| SweepError::ProbeFailed("script copy timed out".into()))??;
        if !status.success() {
            return Err(SweepError::ProbeFailed(format!(
                "script copy to {} exited with {}",
                path, status
            )));
        }

        let min_vram_mib = u64::from(self.settings.minimum_vram_gb) * 1024;
        let max_util_pct = (self.settings.usage_criterion * 100.0).round() as u64;
        let mut run = control.command("sh");
        run.arg(path)
            .arg(min_vram_mib.to_string())
            .arg(max_util_pct.to_string());
        let output = timeout(self.settings.probe_timeout, run.output())
            .await
            .map_err(|_| SweepError::ProbeFailed("probe timed out".into()))??;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_gpu_info(&stdout).ok_or_else(|| {
            SweepError::ProbeFailed(format!("unrecognized probe output: {}", stdout.trim()))
        })
    }

    async fn remove_probe(&self, control: &Session, path: &str) {
        let mut rm = control.command("rm");
        rm.arg("-f").arg(path);
        if let Err(error) = rm.status().await {
            tracing::warn!(node = %self.name, %error, "failed to delete remote probe script");
        }
    }

    /// Terminates the remote process: SIGTERM, a grace window, SIGKILL.
    async fn terminate(&self, control: &Session, pid: Option<u32>, child: openssh::RemoteChild<'_>) {
        let pid = match pid {
            Some(pid) => pid,
            None => {
                tracing::warn!(node = %self.name, "no remote PID recorded, dropping channel only");
                let _ = child.disconnect().await;
                return;
            }
        };
        let mut term = control.command("kill");
        term.arg("-TERM").arg(pid.to_string());
        let _ = term.status().await;
        if timeout(self.settings.kill_grace, child.wait()).await.is_err() {
            let mut kill = control.command("kill");
            kill.arg("-KILL").arg(pid.to_string());
            let _ = kill.status().await;
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
impl ComputeNode for SshNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> &str {
        &self.details.address
    }

    async fn open_connection(&mut self) -> bool {
        let sessions = timeout(self.settings.connect_timeout, self.ensure_sessions()).await;
        let (control, data) = match sessions {
            Ok(Ok(pair)) => pair,
            Ok(Err(error)) => {
                tracing::warn!(node = %self.name, %error, "failed to connect");
                return false;
            }
            Err(_) => {
                tracing::warn!(node = %self.name, "connection attempt timed out");
                return false;
            }
        };
        if !self.free_gpus.is_empty() {
            return true;
        }
        match self.discover_gpus(&control, &data).await {
            Ok(gpus) => {
                tracing::info!(node = %self.name, ?gpus, "discovered free GPUs");
                self.free_gpus = gpus;
                !self.free_gpus.is_empty()
            }
            Err(error) => {
                tracing::warn!(node = %self.name, %error, "GPU discovery failed");
                false
            }
        }
    }

    async fn run(&mut self, command: &str, label: &str) -> bool {
        let control = match &self.control {
            Some(session) => Arc::clone(session),
            None => {
                self.push_status(label, RunStatus::Failed, Some("not connected".into()));
                return false;
            }
        };
        let gpu = match self.free_gpus.pop() {
            Some(gpu) => gpu,
            None => {
                self.push_status(label, RunStatus::Failed, Some("no free GPU".into()));
                return false;
            }
        };

        self.push_status(label, RunStatus::Running, None);
        let wrapped = format!(
            "echo \"[[SWEEP PID]] $$\"; export CUDA_VISIBLE_DEVICES={}; exec {}",
            gpu, command
        );
        let mut cmd = control.command("sh");
        cmd.arg("-c").raw_arg(format!("'{}'", wrapped));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        let mut child = match cmd.spawn().await {
            Ok(child) => child,
            Err(error) => {
                self.push_status(
                    label,
                    RunStatus::Failed,
                    Some(format!("failed to spawn remote command: {}", error)),
                );
                return false;
            }
        };

        let stdout = child.stdout().take().unwrap();
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
                self.terminate(&control, outcome.pid, child).await;
                Some(reason)
            }
            None => {
                let mut stderr_buf = String::new();
                if let Some(mut stderr) = child.stderr().take() {
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
                    Err(_) => Some("process did not exit after stdout closed".into()),
                }
            }
        };

        match failure {
            Some(reason) => {
                // The GPU stays out of the free list: a run that died on it
                // may still be holding memory until the node is re-probed.
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
        self.control = None;
        self.data = None;
        self.free_gpus.clear();
    }
}
