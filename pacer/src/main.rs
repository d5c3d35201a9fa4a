//! Pacer - delayed task scheduler
//!
//! CLI entry point: runs demo workloads through the scheduler and prints the
//! effective configuration.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, eyre};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use pacer::cli::{Cli, Command, OutputFormat};
use pacer::config::{Config, LoggingConfig};
use pacer::scheduler::{
    Clock, Scheduler, SchedulerConfig, SchedulerStats, ShutdownMode, TaskExecutionError, TokioClock, from_fn,
};

fn setup_logging(logging: &LoggingConfig, cli_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_dir = logging.log_dir();
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(logging.level.as_deref()) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("pacer.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!(?level, log_dir = %log_dir.display(), "Logging initialized");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging comes first so config loading can report what it found
    let logging = Config::load_logging(cli.config.as_ref());
    setup_logging(&logging, cli.log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate()?;

    info!(
        "Pacer loaded config: max_tokens={}, refill_rate_per_sec={}",
        config.scheduler.max_tokens, config.scheduler.refill_rate_per_sec
    );

    match cli.command {
        Some(Command::Run {
            delays,
            fail,
            max_tokens,
            rate,
            no_drain,
            deadline_ms,
            format,
        }) => {
            let mut scheduler_config = config.scheduler.clone();
            if let Some(max_tokens) = max_tokens {
                scheduler_config.max_tokens = max_tokens;
            }
            if let Some(rate) = rate {
                scheduler_config.refill_rate_per_sec = rate;
            }
            let plan = RunPlan {
                delays,
                fail,
                drain: !no_drain,
                deadline: deadline_ms.map(Duration::from_millis),
            };
            cmd_run(scheduler_config, plan, format).await
        }
        Some(Command::Config { format }) => cmd_config(&config, format),
        None => {
            println!("No command given. Try `pacer run -t 500 -t 1000` or `pacer --help`.");
            Ok(())
        }
    }
}

/// Demo workload parameters
struct RunPlan {
    delays: Vec<u64>,
    fail: Vec<usize>,
    drain: bool,
    deadline: Option<Duration>,
}

/// One executed demo task
#[derive(Debug, Serialize)]
struct ExecutionRecord {
    task: usize,
    due_ms: u64,
    ran_ms: u64,
    at: DateTime<Local>,
    ok: bool,
}

#[derive(Debug, Serialize)]
struct RunReport {
    executions: Vec<ExecutionRecord>,
    failures: Vec<String>,
    stats: SchedulerStats,
}

/// Schedule one task per delay, wait for them, then shut down
async fn cmd_run(scheduler_config: SchedulerConfig, plan: RunPlan, format: OutputFormat) -> Result<()> {
    debug!(?scheduler_config, delays = ?plan.delays, "cmd_run: called");
    let (record_tx, mut record_rx) = mpsc::unbounded_channel::<ExecutionRecord>();
    let (failure_tx, mut failure_rx) = mpsc::unbounded_channel::<String>();

    // Due times and report offsets share one origin
    let clock = Arc::new(TokioClock::new());
    let scheduler = Scheduler::builder(scheduler_config)
        .clock(clock.clone())
        .error_sink(move |error: TaskExecutionError| {
            let _ = failure_tx.send(error.to_string());
        })
        .spawn()
        .context("Failed to start scheduler")?;

    for (i, delay_ms) in plan.delays.iter().copied().enumerate() {
        let index = i + 1;
        let should_fail = plan.fail.contains(&index);
        let tx = record_tx.clone();
        let task_clock = clock.clone();
        scheduler.schedule_at(
            from_fn(move || {
                let _ = tx.send(ExecutionRecord {
                    task: index,
                    due_ms: delay_ms,
                    ran_ms: task_clock.now().as_millis() as u64,
                    at: Local::now(),
                    ok: !should_fail,
                });
                if should_fail {
                    return Err(eyre!("task {} failed on request", index));
                }
                Ok(())
            }),
            Duration::from_millis(delay_ms),
        )?;
    }
    drop(record_tx);

    let printer = {
        let live = format == OutputFormat::Text;
        tokio::spawn(async move {
            let mut records = Vec::new();
            while let Some(record) = record_rx.recv().await {
                if live {
                    print_record(&record);
                }
                records.push(record);
            }
            records
        })
    };

    let last_due = Duration::from_millis(plan.delays.iter().copied().max().unwrap_or(0));
    let wait_for = match plan.deadline {
        Some(deadline) => deadline.min(last_due),
        None => last_due,
    };
    clock.sleep_until(wait_for).await;

    // A deadline cuts the run short: only work already due may finish
    let mode = match (plan.drain, plan.deadline) {
        (false, _) => ShutdownMode::Abort,
        (true, Some(_)) => ShutdownMode::DrainDue,
        (true, None) => ShutdownMode::DrainAll,
    };
    info!(?mode, "cmd_run: shutting down");
    let stats = scheduler.stop_with(mode).await.context("Scheduler did not stop cleanly")?;

    let executions = printer.await.context("Output task failed")?;
    let mut failures = Vec::new();
    while let Ok(failure) = failure_rx.try_recv() {
        failures.push(failure);
    }

    let report = RunReport {
        executions,
        failures,
        stats,
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_summary(&report),
    }
    Ok(())
}

fn print_record(record: &ExecutionRecord) {
    let marker = if record.ok { "ok".green() } else { "failed".red() };
    println!(
        "Task {} executed at {} (+{}ms, due +{}ms) [{}]",
        record.task,
        record.at.format("%H:%M:%S%.3f"),
        record.ran_ms,
        record.due_ms,
        marker
    );
}

fn print_summary(report: &RunReport) {
    for failure in &report.failures {
        println!("{} {}", "Error:".red(), failure);
    }
    let stats = &report.stats;
    println!();
    println!("{}", "Summary".bold());
    println!("-------");
    println!("Scheduled:    {}", stats.total_scheduled);
    println!("Executed:     {}", stats.total_executed);
    println!("Failed:       {}", stats.total_failed);
    println!("Rate limited: {}", stats.total_rate_limited);
    println!("Abandoned:    {}", stats.total_abandoned);
}

/// Print the effective configuration
fn cmd_config(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(%format, "cmd_config: called");
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        OutputFormat::Text => print!("{}", serde_yaml::to_string(config)?),
    }
    let log_dir = config.logging.log_dir();
    eprintln!("Log file: {}", Path::new(&log_dir).join("pacer.log").display());
    Ok(())
}
