//! Docker executor.
//!
//! Runs each job in a fresh build container, next to optional service
//! containers, with per-project cache directories bind-mounted from the host.

pub mod api;
pub mod services;
pub mod volumes;

#[cfg(test)]
mod fake;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use kiln_core::config::{DockerConfig, RunnerConfig};
use kiln_core::executor::{Completion, CompletionSender, Executor};
use kiln_core::handle::{ContainerHandle, ImageHandle};
use kiln_core::job::Job;
use kiln_core::log::LogSink;
use kiln_core::{Error, Result};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use self::api::{BollardApi, ContainerApi, ContainerIo, ContainerSpec, resolve_endpoint};
use self::services::ServiceSpec;
use self::volumes::{VolumeRequest, cache_root, create_volumes};

/// Build container command: bash when the image has it, plain sh otherwise.
/// The job script arrives on stdin.
const BUILD_SHELL: [&str; 3] = [
    "sh",
    "-c",
    "if [ -x /usr/local/bin/bash ]; then exec /usr/local/bin/bash; \
     elif [ -x /usr/bin/bash ]; then exec /usr/bin/bash; \
     elif [ -x /bin/bash ]; then exec /bin/bash; \
     else exec sh; fi",
];

/// Docker executor for one job.
pub struct DockerExecutor {
    client: Option<Arc<dyn ContainerApi>>,
    runner: Option<RunnerConfig>,
    job: Option<Job>,
    image: Option<ImageHandle>,
    services: Vec<ContainerHandle>,
    service_links: Vec<String>,
    binds: Vec<String>,
    container: Option<ContainerHandle>,
    task: Option<JoinHandle<()>>,
}

impl DockerExecutor {
    /// Create an executor that connects to the daemon during `prepare`.
    pub fn new() -> Self {
        Self {
            client: None,
            runner: None,
            job: None,
            image: None,
            services: Vec::new(),
            service_links: Vec::new(),
            binds: Vec::new(),
            container: None,
            task: None,
        }
    }

    /// Create with a custom daemon client; endpoint resolution is skipped.
    pub fn with_client(client: Arc<dyn ContainerApi>) -> Self {
        Self {
            client: Some(client),
            ..Self::new()
        }
    }

    /// Service containers started so far.
    pub fn services(&self) -> &[ContainerHandle] {
        &self.services
    }

    /// Bind entries computed for the build container.
    pub fn binds(&self) -> &[String] {
        &self.binds
    }

    fn client(&self) -> Result<Arc<dyn ContainerApi>> {
        self.client
            .clone()
            .ok_or_else(|| Error::Internal("docker executor is not connected".to_string()))
    }

    fn context(&self) -> Result<(&RunnerConfig, &DockerConfig, &Job)> {
        match (&self.runner, &self.job) {
            (Some(runner), Some(job)) => Ok((runner, runner.docker()?, job)),
            _ => Err(Error::Internal("docker executor is not prepared".to_string())),
        }
    }

    async fn connect(&mut self, docker: &DockerConfig) -> Result<()> {
        let client = if let Some(client) = self.client.clone() {
            client
        } else {
            let endpoint =
                resolve_endpoint(docker.host.as_deref(), std::env::var("DOCKER_HOST").ok());
            debug!(endpoint = %endpoint, "Connecting to Docker daemon");
            let client: Arc<dyn ContainerApi> = Arc::new(BollardApi::connect(&endpoint)?);
            self.client = Some(client.clone());
            client
        };

        client.ping().await
    }

    /// Image reference, qualified with the configured registry.
    fn image_ref(docker: &DockerConfig, name: &str) -> String {
        match &docker.registry {
            Some(registry) if !registry.is_empty() => {
                format!("{}/{}", registry.trim_end_matches('/'), name)
            }
            _ => name.to_string(),
        }
    }

    /// Resolve an image from the local cache, pulling it when allowed.
    async fn get_image(&self, name: &str) -> Result<ImageHandle> {
        let client = self.client()?;
        let (_, docker, job) = self.context()?;
        let image = Self::image_ref(docker, name);

        debug!(image = %image, "Looking for image");
        if let Some(handle) = client.inspect_image(&image).await? {
            return Ok(handle);
        }

        if docker.disable_pull {
            return Err(Error::ImageNotFound(image));
        }

        info!(image = %image, "Pulling image");
        job.log.system(format!("Pulling docker image {} ...", image));
        client.pull_image(&image).await?;

        client
            .inspect_image(&image)
            .await?
            .ok_or(Error::ImageNotFound(image))
    }

    /// Start every service in order. Stops at the first failure; services
    /// started before it stay tracked for cleanup.
    async fn create_services(&mut self, services: &[ServiceSpec]) -> Result<()> {
        for service in services {
            let handle = self.create_service(service).await?;
            debug!(service = %service.image(), container = %handle.id, "Created service");

            let (_, _, job) = self.context()?;
            let link = service.link(&job.project_unique_name);
            self.service_links.push(link);
            self.services.push(handle);
        }
        Ok(())
    }

    async fn create_service(&self, service: &ServiceSpec) -> Result<ContainerHandle> {
        let client = self.client()?;
        let image = self.get_image(&service.image()).await?;
        let (runner, _, job) = self.context()?;

        let name = service.container_name(&job.project_unique_name);
        remove_stale(client.as_ref(), &name).await;

        let spec = ContainerSpec {
            name: name.clone(),
            image: image.id,
            env: job.merged_env(&runner.environment),
            ..Default::default()
        };

        debug!(container = %name, "Creating service container");
        let handle = client.create_container(&spec).await?;

        debug!(container = %handle.id, "Starting service container");
        if let Err(e) = client.start_container(&handle.id).await {
            spawn_removal(client, handle.id);
            return Err(e);
        }

        Ok(handle)
    }

    /// Create and start the build container, attached for the job script.
    async fn create_container(&self) -> Result<(ContainerHandle, ContainerIo)> {
        let client = self.client()?;
        let (runner, docker, job) = self.context()?;
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| Error::Internal("no build image resolved".to_string()))?;

        let name = job.project_unique_name.clone();
        let hostname = docker
            .hostname
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| name.clone());

        let mut links = docker.links.clone();
        links.extend(self.service_links.iter().cloned());

        let spec = ContainerSpec {
            name: name.clone(),
            image: image.id.clone(),
            hostname: Some(hostname),
            env: job.merged_env(&runner.environment),
            cmd: Some(BUILD_SHELL.iter().map(|s| s.to_string()).collect()),
            interactive: true,
            privileged: docker.privileged,
            binds: self.binds.clone(),
            links,
            extra_hosts: docker.extra_hosts.clone(),
        };

        remove_stale(client.as_ref(), &name).await;

        debug!(container = %name, "Creating container");
        let handle = match client.create_container(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                // The daemon may have registered the name before failing.
                spawn_removal(client, name);
                return Err(e);
            }
        };

        let io = match client.attach_container(&handle.id).await {
            Ok(io) => io,
            Err(e) => {
                spawn_removal(client, handle.id);
                return Err(e);
            }
        };

        debug!(container = %handle.id, "Starting container");
        if let Err(e) = client.start_container(&handle.id).await {
            spawn_removal(client, handle.id);
            return Err(e);
        }

        Ok((handle, io))
    }
}

impl Default for DockerExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn prepare(&mut self, config: &RunnerConfig, job: &Job) -> Result<()> {
        self.runner = Some(config.clone());
        self.job = Some(job.clone());

        let docker = config.docker()?.clone();
        if docker.image.is_empty() {
            return Err(Error::Config("missing image in docker configuration".to_string()));
        }

        // Reject malformed services before anything is created.
        let services = docker
            .services
            .iter()
            .map(|s| ServiceSpec::parse(s))
            .collect::<Result<Vec<_>>>()?;

        info!(job_id = %job.id, image = %docker.image, "Using Docker executor");
        job.log
            .system(format!("Using Docker executor with image {} ...", docker.image));

        self.connect(&docker).await?;

        self.image = Some(self.get_image(&docker.image).await?);

        if !services.is_empty() {
            debug!(count = services.len(), "Creating services");
            self.create_services(&services).await?;
        }

        if !docker.disable_cache {
            debug!("Creating cache directories");
            let root = cache_root(docker.cache_dir.as_deref())?;
            let bindings = create_volumes(&VolumeRequest {
                cache_root: &root,
                project_unique_name: &job.project_unique_name,
                volumes: &docker.volumes,
                image: self.image.as_ref(),
                builds_dir: job.allow_git_fetch.then_some(job.builds_dir.as_str()),
            })
            .await?;
            self.binds = bindings.iter().map(|b| b.bind_entry()).collect();
        }

        Ok(())
    }

    async fn start(&mut self) -> Result<Completion> {
        let client = self.client()?;
        let (_, _, job) = self.context()?;
        let script = job.script.clone();
        let log = job.log.clone();

        let (handle, io) = self.create_container().await?;
        info!(container = %handle.name, id = %handle.id, "Build container started");
        self.container = Some(handle.clone());

        let (tx, completion) = Completion::channel();
        self.task = Some(tokio::spawn(run_build(client, handle, io, script, log, tx)));
        Ok(completion)
    }

    async fn cleanup(&mut self) {
        // A job still running when cleanup starts resolves as cancelled.
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let mut doomed: Vec<ContainerHandle> = self.services.drain(..).collect();
        doomed.extend(self.container.take());
        self.service_links.clear();

        let Some(client) = self.client.clone() else {
            return;
        };

        for handle in doomed {
            match client.remove_container(&handle.id).await {
                Ok(true) => debug!(container = %handle.name, "Removed container"),
                Ok(false) => debug!(container = %handle.name, "Container already gone"),
                Err(e) => warn!(container = %handle.name, error = %e, "Failed to remove container"),
            }
        }
    }
}

/// Feed the script, forward output and deliver the exit status.
async fn run_build(
    client: Arc<dyn ContainerApi>,
    container: ContainerHandle,
    io: ContainerIo,
    script: Bytes,
    log: LogSink,
    tx: CompletionSender,
) {
    let result = stream_build(client.as_ref(), &container, io, script, log).await;
    debug!(container = %container.name, ok = result.is_ok(), "Build finished");
    tx.finish(result);
}

async fn stream_build(
    client: &dyn ContainerApi,
    container: &ContainerHandle,
    io: ContainerIo,
    script: Bytes,
    log: LogSink,
) -> Result<()> {
    let ContainerIo { mut output, mut input } = io;

    let feed = async move {
        input.write_all(&script).await?;
        input.shutdown().await
    };

    let drain = async {
        while let Some(chunk) = output.next().await {
            let (stream, data) = chunk?;
            log.write(stream, data);
        }
        Ok::<(), Error>(())
    };

    let (fed, drained) = tokio::join!(feed, drain);
    drained?;
    if let Err(e) = fed {
        warn!(container = %container.name, error = %e, "Failed to write build script");
    }

    match client.wait_container(&container.id).await? {
        0 => Ok(()),
        code => Err(Error::RemoteExecution {
            exit_code: i32::try_from(code).ok(),
            message: format!("build container exited with code {}", code),
        }),
    }
}

/// Best-effort removal of a same-named leftover before creating a container.
/// A failure here surfaces as a name conflict on create.
async fn remove_stale(client: &dyn ContainerApi, name: &str) {
    match client.remove_container(name).await {
        Ok(true) => debug!(container = %name, "Removed stale container"),
        Ok(false) => {}
        Err(e) => warn!(container = %name, error = %e, "Failed to remove stale container"),
    }
}

/// Remove a container in the background without blocking the caller.
fn spawn_removal(client: Arc<dyn ContainerApi>, target: String) {
    tokio::spawn(async move {
        if let Err(e) = client.remove_container(&target).await {
            warn!(container = %target, error = %e, "Failed to remove container");
        }
    });
}
