//! Container daemon access.
//!
//! [`ContainerApi`] is the narrow slice of the daemon the executor uses;
//! [`BollardApi`] implements it over the Docker Engine API.

use std::pin::Pin;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use kiln_core::handle::{ContainerHandle, ImageHandle};
use kiln_core::log::LogStream;
use kiln_core::{Error, Result};
use tokio::io::AsyncWrite;
use tracing::debug;

pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Request timeout for daemon calls, in seconds.
const DAEMON_TIMEOUT_SECS: u64 = 120;

/// Everything needed to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    /// Keep stdin open for a single attach, used to feed the job script.
    pub interactive: bool,
    pub privileged: bool,
    pub binds: Vec<String>,
    pub links: Vec<String>,
    pub extra_hosts: Vec<String>,
}

/// Output chunks of an attached container.
pub type OutputStream = BoxStream<'static, Result<(LogStream, Bytes)>>;

/// Streams of an attached container.
pub struct ContainerIo {
    pub output: OutputStream,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

#[async_trait]
pub trait ContainerApi: Send + Sync {
    /// Confirm the daemon answers.
    async fn ping(&self) -> Result<()>;

    /// Look an image up in the local cache. `None` when absent.
    async fn inspect_image(&self, name: &str) -> Result<Option<ImageHandle>>;

    async fn pull_image(&self, name: &str) -> Result<()>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    async fn attach_container(&self, id: &str) -> Result<ContainerIo>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Wait until the container stops and return its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64>;

    /// Force-remove a container, by id or name, with its anonymous volumes.
    /// `false` when no such container exists.
    async fn remove_container(&self, id: &str) -> Result<bool>;
}

/// Daemon endpoint: configured host, then `DOCKER_HOST`, then the local socket.
pub fn resolve_endpoint(configured: Option<&str>, env_host: Option<String>) -> String {
    configured
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .or(env_host.filter(|host| !host.is_empty()))
        .unwrap_or_else(|| DEFAULT_DOCKER_HOST.to_string())
}

/// [`ContainerApi`] over the Docker Engine API.
pub struct BollardApi {
    docker: Docker,
}

impl BollardApi {
    /// Connect to a `unix://`, `tcp://` or `http://` endpoint.
    pub fn connect(endpoint: &str) -> Result<Self> {
        let docker = if let Some(path) = endpoint.strip_prefix("unix://") {
            Docker::connect_with_unix(path, DAEMON_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
        } else if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") {
            Docker::connect_with_http(endpoint, DAEMON_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
        } else {
            return Err(Error::Connection(format!(
                "unsupported docker endpoint '{}'",
                endpoint
            )));
        };

        let docker = docker.map_err(|e| Error::Connection(format!("{}: {}", endpoint, e)))?;
        Ok(Self { docker })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerApi for BollardApi {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::Connection(e.to_string()))
    }

    async fn inspect_image(&self, name: &str) -> Result<Option<ImageHandle>> {
        let image = match self.docker.inspect_image(name).await {
            Ok(image) => image,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(Error::Connection(e.to_string())),
        };

        let mut volumes: Vec<String> = image
            .config
            .and_then(|config| config.volumes)
            .map(|volumes| volumes.into_keys().collect())
            .unwrap_or_default();
        volumes.sort();

        Ok(Some(ImageHandle {
            id: image.id.unwrap_or_else(|| name.to_string()),
            volumes,
        }))
    }

    async fn pull_image(&self, name: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: name.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %name, status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    return Err(Error::PullFailure {
                        image: name.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let non_empty = |items: &Vec<String>| (!items.is_empty()).then(|| items.clone());

        let host_config = HostConfig {
            privileged: Some(spec.privileged),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            binds: non_empty(&spec.binds),
            links: non_empty(&spec.links),
            extra_hosts: non_empty(&spec.extra_hosts),
            ..Default::default()
        };

        let config = Config {
            hostname: spec.hostname.clone(),
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            cmd: spec.cmd.clone(),
            tty: Some(false),
            attach_stdin: Some(spec.interactive),
            attach_stdout: Some(spec.interactive),
            attach_stderr: Some(spec.interactive),
            open_stdin: Some(spec.interactive),
            stdin_once: Some(spec.interactive),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::ContainerCreate {
                name: spec.name.clone(),
                message: e.to_string(),
            })?;

        Ok(ContainerHandle {
            id: response.id,
            name: spec.name.clone(),
        })
    }

    async fn attach_container(&self, id: &str) -> Result<ContainerIo> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            detach_keys: None,
        };

        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(id, Some(options))
            .await
            .map_err(|e| Error::ContainerStart {
                name: id.to_string(),
                message: format!("attach failed: {}", e),
            })?;

        let output = output
            .map(|result| match result {
                Ok(LogOutput::StdErr { message }) => Ok((LogStream::Stderr, message)),
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::Console { message })
                | Ok(LogOutput::StdIn { message }) => Ok((LogStream::Stdout, message)),
                Err(e) => Err(Error::RemoteExecution {
                    exit_code: None,
                    message: e.to_string(),
                }),
            })
            .boxed();

        Ok(ContainerIo { output, input })
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ContainerStart {
                name: id.to_string(),
                message: e.to_string(),
            })
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits arrive as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Error::RemoteExecution {
                exit_code: None,
                message: e.to_string(),
            }),
            None => Err(Error::RemoteExecution {
                exit_code: None,
                message: "wait stream ended without a status".to_string(),
            }),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<bool> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(Error::Internal(format!(
                "failed to remove container {}: {}",
                id, e
            ))),
        }
    }
}
