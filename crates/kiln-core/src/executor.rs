//! Executor trait and completion signal.
//!
//! An executor provisions an isolated environment for one job, runs the job's
//! script inside it and tears the environment down again. The caller drives
//! it strictly in order: [`Executor::prepare`], [`Executor::start`], then
//! [`Executor::cleanup`] no matter what happened before.

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::config::RunnerConfig;
use crate::job::Job;
use crate::{Error, Result};

/// Trait for job executors.
#[async_trait]
pub trait Executor: Send {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Validate configuration, connect to the control plane and provision
    /// everything the job needs before its script can run.
    async fn prepare(&mut self, config: &RunnerConfig, job: &Job) -> Result<()>;

    /// Launch the job's script and return without waiting for it.
    ///
    /// The job's own outcome arrives later through the returned
    /// [`Completion`]; an `Err` here is an infrastructure failure.
    async fn start(&mut self) -> Result<Completion>;

    /// Release every resource created so far. Failures are logged, never
    /// returned, and the call is valid after a failed `prepare`.
    async fn cleanup(&mut self);
}

/// Receiving half of the one-shot job result.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<()>>,
}

/// Sending half of the one-shot job result. Consumed on delivery.
#[derive(Debug)]
pub struct CompletionSender {
    tx: oneshot::Sender<Result<()>>,
}

impl Completion {
    pub fn channel() -> (CompletionSender, Completion) {
        let (tx, rx) = oneshot::channel();
        (CompletionSender { tx }, Completion { rx })
    }

    /// Wait for the job result. Resolves to [`Error::Cancelled`] if the task
    /// running the job went away without reporting.
    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(Error::Cancelled))
    }
}

impl CompletionSender {
    pub fn finish(self, result: Result<()>) {
        // The caller may have stopped listening; the result is then moot.
        let _ = self.tx.send(result);
    }
}
