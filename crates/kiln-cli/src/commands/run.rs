//! Local job execution command.

use std::io::Write;

use anyhow::{Context, Result};
use bytes::Bytes;
use kiln_core::config::RunnerConfig;
use kiln_core::job::Job;
use kiln_core::log::{LogChunk, LogSink, LogStream};
use kiln_executor::{Executor, executor_for};
use tokio::sync::mpsc;
use tracing::{error, info};

pub struct RunArgs {
    pub config: String,
    pub script: String,
    pub project: String,
    pub runner: Option<String>,
    pub allow_fetch: bool,
    pub env: Vec<String>,
}

/// Run one job through prepare, start and cleanup.
pub async fn run_job(args: RunArgs) -> Result<()> {
    let config = kiln_config::load_runner_config(&args.config)
        .with_context(|| format!("Failed to load runner config: {}", args.config))?;

    let script = tokio::fs::read(&args.script)
        .await
        .with_context(|| format!("Failed to read script: {}", args.script))?;

    let (log, rx) = LogSink::channel();
    let job = build_job(&config, &args, Bytes::from(script), log);
    let printer = tokio::spawn(print_log(rx));

    let mut executor = executor_for(config.executor);
    info!(job_id = %job.id, executor = executor.name(), project = %job.project_unique_name, "Running job");

    let result = execute(executor.as_mut(), &config, &job).await;
    executor.cleanup().await;

    // The printer finishes once every sink clone is gone.
    drop(executor);
    drop(job);
    printer.await.context("Log printer task failed")?;

    match result {
        Ok(()) => {
            info!("Job succeeded");
            Ok(())
        }
        Err(e) if e.is_job_failure() => {
            error!(error = %e, "Job failed");
            anyhow::bail!("Job failed: {}", e)
        }
        Err(e) => {
            error!(error = %e, "Runner failed");
            Err(e).context("Runner failed")
        }
    }
}

async fn execute(
    executor: &mut dyn Executor,
    config: &RunnerConfig,
    job: &Job,
) -> kiln_core::Result<()> {
    executor.prepare(config, job).await?;
    let completion = executor.start().await?;
    completion.wait().await
}

fn build_job(config: &RunnerConfig, args: &RunArgs, script: Bytes, log: LogSink) -> Job {
    let mut job = Job::new(args.project.clone(), script);
    if let Some(runner) = &args.runner {
        job.project_runner_name = runner.clone();
        job.runner_name = runner.clone();
    }
    job.env = args.env.clone();
    job.allow_git_fetch = args.allow_fetch;
    job.builds_dir = config.builds_dir.clone();
    job.log = log;
    job
}

async fn print_log(mut rx: mpsc::UnboundedReceiver<LogChunk>) {
    while let Some(chunk) = rx.recv().await {
        let result = match chunk.stream {
            LogStream::Stdout => std::io::stdout().write_all(&chunk.data),
            LogStream::Stderr => std::io::stderr().write_all(&chunk.data),
            LogStream::System => std::io::stdout().write_all(format!("* {}", chunk.text()).as_bytes()),
        };
        if result.is_err() {
            return;
        }
    }
    let _ = std::io::stdout().flush();
}
