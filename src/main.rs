use std::collections::HashMap;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use colourado::{ColorPalette, PaletteType};
use itertools::Itertools;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridsweep::{
    get_targets, get_tasks, Config, LogEvent, Payload, RunManager, RunStatus, Settings, SweepError,
    TaskQueue,
};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Config::parse();
    let mut settings = Settings::from_env();
    settings.apply_cli(&cli);

    let targets = match get_targets(&cli.targets_file) {
        Ok(targets) => targets,
        Err(error) => {
            eprintln!("[gridsweep] Failed to load {}: {}", cli.targets_file, error);
            return ExitCode::FAILURE;
        }
    };
    let tasks = match get_tasks(&cli.queue_file) {
        Ok(tasks) => tasks,
        Err(error) => {
            eprintln!("[gridsweep] Failed to load {}: {}", cli.queue_file, error);
            return ExitCode::FAILURE;
        }
    };

    if cli.check {
        println!(
            "[gridsweep] {} target(s) in {}, {} task(s) in {}",
            targets.len(),
            cli.targets_file,
            tasks.len(),
            cli.queue_file
        );
        return ExitCode::SUCCESS;
    }

    let task_queue = TaskQueue::new();
    let task_count = tasks.len();
    for task in tasks {
        task_queue.put(task);
    }

    // One color per node address; every line a node emits is prefixed
    // with its colored address.
    let palette = ColorPalette::new(targets.len() as u32, PaletteType::Pastel, false);
    let colors: HashMap<String, colourado::Color> = targets
        .values()
        .map(|details| details.address.clone())
        .sorted()
        .zip(palette.colors.into_iter())
        .collect();

    let (log_tx, log_rx) = flume::unbounded::<LogEvent>();
    let print_period = cli.print_period;
    let printer = tokio::spawn(async move {
        let mut raw_seen: HashMap<String, usize> = HashMap::new();
        let mut failed: Vec<(String, String)> = Vec::new();
        while let Ok(event) = log_rx.recv_async().await {
            let prefix = match colors.get(&event.node) {
                Some(color) => {
                    let r = (color.red * 255.0) as u8;
                    let g = (color.green * 255.0) as u8;
                    let b = (color.blue * 255.0) as u8;
                    format!("[{}]", event.node).truecolor(r, g, b)
                }
                None => format!("[{}]", event.node).normal(),
            };
            match event.payload {
                Payload::Raw { line } => {
                    if print_period == 0 {
                        continue;
                    }
                    let seen = raw_seen.entry(event.label.clone()).or_insert(0);
                    *seen += 1;
                    if *seen % print_period == 0 {
                        println!("{} {} | {}", prefix, event.label, line);
                    }
                }
                Payload::Status { status, message } => {
                    if status == RunStatus::Failed {
                        failed.push((
                            event.label.clone(),
                            message.clone().unwrap_or_default(),
                        ));
                    }
                    match message {
                        Some(message) => {
                            println!("{} {} :: {} ({})", prefix, event.label, status.as_str(), message)
                        }
                        None => println!("{} {} :: {}", prefix, event.label, status.as_str()),
                    }
                }
                Payload::Progress {
                    elapsed,
                    losses,
                    completed,
                } => {
                    let losses = losses
                        .iter()
                        .sorted_by(|a, b| a.0.cmp(b.0))
                        .map(|(k, v)| format!("{}={}", k, v))
                        .join(" ");
                    println!(
                        "{} {} :: step {} ({}s) {}",
                        prefix, event.label, completed, elapsed, losses
                    );
                }
                Payload::TestAccuracy { test_acc } => {
                    println!("{} {} :: test accuracy {}", prefix, event.label, test_acc);
                }
            }
        }
        failed
    });

    let mut manager = RunManager::new(settings, targets, task_queue, log_tx);

    // Ctrl-c cancels the sweep; workers finish their current command.
    let stop_handle = manager.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("[gridsweep] Ctrl-c detected, stopping the sweep.");
            stop_handle.request_stop();
        }
    });

    let result = manager.start_run().await;
    drop(manager);

    let failed = printer.await.unwrap_or_default();
    if !failed.is_empty() {
        eprintln!("[gridsweep] {} failed attempt(s) during the sweep:", failed.len());
        for (label, message) in &failed {
            eprintln!("[gridsweep]   {} ({})", label, message);
        }
    }

    match result {
        Ok(()) => {
            eprintln!("[gridsweep] All {} task(s) completed.", task_count);
            ExitCode::SUCCESS
        }
        Err(error @ SweepError::TargetsExhausted { .. }) => {
            eprintln!("[gridsweep] {}", error);
            ExitCode::FAILURE
        }
        Err(error) => {
            eprintln!("[gridsweep] Sweep aborted: {}", error);
            ExitCode::FAILURE
        }
    }
}
