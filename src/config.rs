//! Configuration for Gridsweep.
//!
//! Holds the clap struct for command line arguments and the `Settings`
//! struct that tunes the sweep core. Settings defaults can be overridden
//! through environment variables first and command line flags second.

use std::time::Duration;

use clap::Parser;

#[derive(Parser)]
#[command(version, author)]
pub struct Config {
    /// Target file to use. Defaults to `targets.yaml`
    #[arg(long, default_value = "targets.yaml")]
    pub targets_file: String,

    /// Queue file to use. Defaults to `queue.yaml`
    #[arg(long, default_value = "queue.yaml")]
    pub queue_file: String,

    /// Validate the target and queue files, then exit without running
    #[arg(long, short)]
    pub check: bool,

    /// Maximum number of concurrent workers (default: one per target)
    #[arg(long, short)]
    pub max_workers: Option<usize>,

    /// Connection retry budget per target
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Seconds a failed target stays in cooldown before it is retried
    #[arg(long)]
    pub retry_interval: Option<u64>,

    /// Seconds a command may go without producing output before it is killed
    #[arg(long)]
    pub run_timeout: Option<u64>,

    /// How often to print raw output lines. Giving 0 suppresses them.
    #[arg(long, short, default_value = "1")]
    pub print_period: usize,
}

/// Tuning knobs for the sweep core.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Minimum free VRAM (GB) for a GPU to count as free.
    pub minimum_vram_gb: u32,
    /// Maximum utilization fraction for a GPU to count as free.
    pub usage_criterion: f64,
    /// Worker cap. `None` means one worker per target.
    pub max_workers: Option<usize>,
    /// Heartbeat budget: a run with no output for this long is killed.
    pub run_timeout: Duration,
    /// Connection retry budget per target.
    pub max_retries: u32,
    /// Cooldown before a failed target becomes eligible again.
    pub retry_interval: Duration,
    /// How often the retry sweep scans the cooldown map.
    pub retry_poll_interval: Duration,
    pub connect_timeout: Duration,
    pub probe_timeout: Duration,
    /// Upper bound on a single stdout read before the heartbeat is checked.
    pub read_timeout: Duration,
    /// Grace window between SIGTERM and SIGKILL on a hung remote process.
    pub kill_grace: Duration,
    /// Identical warnings are emitted at most once per this interval.
    pub warn_interval: Duration,
    /// Bounded wait when popping the target queue.
    pub pop_wait: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            minimum_vram_gb: 10,
            usage_criterion: 0.1,
            max_workers: None,
            run_timeout: Duration::from_secs(2100),
            max_retries: 3,
            retry_interval: Duration::from_secs(450),
            retry_poll_interval: Duration::from_secs(450),
            connect_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(10),
            warn_interval: Duration::from_secs(5),
            pop_wait: Duration::from_secs(5),
        }
    }
}

impl Settings {
    /// Reads overrides from the process environment on top of the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::from_env`], but with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(v) = parse_var(&lookup, "MINIMUM_VRAM") {
            settings.minimum_vram_gb = v;
        }
        if let Some(v) = parse_var(&lookup, "USAGE_CRITERION") {
            settings.usage_criterion = v;
        }
        if let Some(v) = parse_var::<i64, _>(&lookup, "MAX_PROCESSES") {
            // Non-positive means unbounded, i.e. one worker per target.
            settings.max_workers = usize::try_from(v).ok().filter(|&v| v > 0);
        }
        if let Some(v) = parse_var(&lookup, "RUN_TIMEOUT") {
            settings.run_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "MAX_RETRIES") {
            settings.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "GRIDSWEEP_RETRY_INTERVAL") {
            settings.retry_interval = Duration::from_secs(v);
            settings.retry_poll_interval = Duration::from_secs(v);
        }
        settings
    }

    /// Applies command line overrides, which win over environment variables.
    pub fn apply_cli(&mut self, cli: &Config) {
        if cli.max_workers.is_some() {
            self.max_workers = cli.max_workers;
        }
        if let Some(v) = cli.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = cli.retry_interval {
            self.retry_interval = Duration::from_secs(v);
            self.retry_poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = cli.run_timeout {
            self.run_timeout = Duration::from_secs(v);
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment variable");
            None
        }
    }
}
