//! The job handed to an executor.

use bytes::Bytes;

use crate::JobId;
use crate::log::LogSink;

/// One build invocation. Owned by the scheduler; executors keep a clone and
/// never mutate it.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Unique per (project, runner). Names the build container and the cache
    /// directory tree.
    pub project_unique_name: String,
    /// Unique per (project, runner) for VM naming.
    pub project_runner_name: String,
    pub runner_name: String,
    /// `KEY=VALUE` variables exposed to the job.
    pub env: Vec<String>,
    /// Whether sources may be fetched incrementally into a cached checkout.
    pub allow_git_fetch: bool,
    pub builds_dir: String,
    /// The generated shell script fed to the remote shell.
    pub script: Bytes,
    pub log: LogSink,
}

impl Job {
    pub fn new(project_unique_name: impl Into<String>, script: impl Into<Bytes>) -> Self {
        let project_unique_name = project_unique_name.into();
        Self {
            id: JobId::new(),
            project_runner_name: project_unique_name.clone(),
            runner_name: project_unique_name.clone(),
            project_unique_name,
            env: Vec::new(),
            allow_git_fetch: false,
            builds_dir: crate::config::DEFAULT_BUILDS_DIR.to_string(),
            script: script.into(),
            log: LogSink::discard(),
        }
    }

    /// Job variables followed by the runner's static environment.
    pub fn merged_env(&self, static_env: &[String]) -> Vec<String> {
        self.env.iter().chain(static_env).cloned().collect()
    }
}
