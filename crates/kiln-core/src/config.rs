//! Runner configuration types.
//!
//! These are loaded by `kiln-config` and are read-only for executors. Section
//! presence is checked by the executor that needs it, so each accessor fails
//! with [`Error::Config`] naming what is missing.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Which backend runs the jobs of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Docker,
    Parallels,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Docker => "docker",
            ExecutorKind::Parallels => "parallels",
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "docker" => Ok(ExecutorKind::Docker),
            "parallels" => Ok(ExecutorKind::Parallels),
            other => Err(format!("unknown executor '{}'", other)),
        }
    }
}

/// Static configuration of one runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub name: String,
    pub executor: ExecutorKind,
    /// Directory the job checks sources out into.
    pub builds_dir: String,
    /// Extra `KEY=VALUE` variables appended after the job's own.
    pub environment: Vec<String>,
    pub docker: Option<DockerConfig>,
    pub parallels: Option<ParallelsConfig>,
    pub ssh: Option<SshConfig>,
}

impl RunnerConfig {
    pub fn new(name: impl Into<String>, executor: ExecutorKind) -> Self {
        Self {
            name: name.into(),
            executor,
            builds_dir: DEFAULT_BUILDS_DIR.to_string(),
            environment: Vec::new(),
            docker: None,
            parallels: None,
            ssh: None,
        }
    }

    pub fn docker(&self) -> Result<&DockerConfig> {
        self.docker
            .as_ref()
            .ok_or_else(|| Error::missing("docker configuration"))
    }

    pub fn parallels(&self) -> Result<&ParallelsConfig> {
        self.parallels
            .as_ref()
            .ok_or_else(|| Error::missing("parallels configuration"))
    }

    pub fn ssh(&self) -> Result<&SshConfig> {
        self.ssh
            .as_ref()
            .ok_or_else(|| Error::missing("ssh configuration"))
    }
}

pub const DEFAULT_BUILDS_DIR: &str = "builds";
pub const DEFAULT_CACHE_DIR: &str = "tmp/docker-cache";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Daemon endpoint, e.g. `unix:///var/run/docker.sock` or `tcp://host:2375`.
    pub host: Option<String>,
    pub image: String,
    pub registry: Option<String>,
    pub hostname: Option<String>,
    /// Root of the host-side cache directories.
    pub cache_dir: Option<String>,
    pub privileged: bool,
    pub disable_pull: bool,
    pub disable_cache: bool,
    pub volumes: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub links: Vec<String>,
    /// Auxiliary service images, `name` or `name:version`.
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelsConfig {
    pub base_name: String,
    pub template_name: Option<String>,
    pub disable_snapshots: bool,
}

impl ParallelsConfig {
    pub fn template_name(&self) -> String {
        match &self.template_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("{}-template", self.base_name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub user: Option<String>,
    pub port: u16,
    pub identity_file: Option<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: None,
            port: 22,
            identity_file: None,
        }
    }
}
