//! agentwave - batch runner entry point
//!
//! Usage: `agentwave <tasks-file>`
//!
//! Runs every task in the file through the agent CLI in waves, prints the
//! JSON batch report to stdout and exits with status 1 if any task failed.

use std::path::PathBuf;
use std::process::ExitCode;

use agentwave::backend::claudecode::ClaudeCodeRunner;
use agentwave::config::Config;
use agentwave::orchestrator::{BatchScheduler, OrchestrationSession};
use agentwave::task::load_tasks;
use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<ExitCode> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr; stdout carries only the report.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentwave=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let tasks_file = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("usage: agentwave <tasks-file>");
            return Ok(ExitCode::from(2));
        }
    };

    let config = Config::from_env()?;
    info!(
        cli = %config.agent.cli_path,
        model = %config.agent.model,
        concurrency = config.concurrency,
        timeout_secs = config.timeout.as_secs(),
        nonzero_exit = %config.nonzero_exit_policy,
        working_dir = %config.working_dir.display(),
        "Loaded configuration"
    );

    let tasks = load_tasks(&tasks_file).await?;
    info!(tasks = tasks.len(), file = %tasks_file.display(), "Loaded tasks");

    let session = OrchestrationSession::new(config.manifest_pattern.clone());
    let mut side_effects = session.subscribe();
    tokio::spawn(async move {
        loop {
            match side_effects.recv().await {
                Ok(effect) => info!(effect = ?effect, "Side effect"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Side-effect observer fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let runner = ClaudeCodeRunner::new(&config, session).into_shared();
    let scheduler = BatchScheduler::new(runner, config.concurrency);

    let cancel = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling batch");
            cancel.cancel();
        }
    });

    let report = scheduler.run(tasks).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialise batch report")?
    );

    Ok(if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}
