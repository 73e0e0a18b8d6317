//! Parallels VM executor.
//!
//! Jobs run over SSH inside a runner VM cloned from a template. With
//! snapshots enabled the VM is kept per runner and reverted to its baseline
//! snapshot before each job; otherwise it is recreated for every job.

pub mod prlctl;
pub mod ssh;

#[cfg(test)]
mod fake;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::config::{ParallelsConfig, RunnerConfig};
use kiln_core::executor::{Completion, Executor};
use kiln_core::handle::VmHandle;
use kiln_core::job::Job;
use kiln_core::{Error, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use self::prlctl::{Hypervisor, Prlctl, VmStatus};
use self::ssh::{OpenSsh, RemoteCommand, RemoteShell};

/// Name of the baseline snapshot taken after a VM is first created.
pub const BASELINE_SNAPSHOT: &str = "Started";

const NTP_SERVER: &str = "time.apple.com";

/// Polling bounds of the VM executor.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Seconds to wait for a DHCP lease while verifying the machine.
    pub verify_ip_wait: u32,
    /// Seconds to wait for a DHCP lease when starting the job.
    pub start_ip_wait: u32,
    /// Attempts at a no-op guest command after the VM boots.
    pub responsive_tries: u32,
    /// Seconds to wait for the VM to report `running`.
    pub status_wait: u32,
    /// Attempts at syncing the guest clock.
    pub clock_sync_tries: u32,
    /// Extra SSH connect attempts during verification.
    pub ssh_retries: u32,
    pub poll_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            verify_ip_wait: 120,
            start_ip_wait: 60,
            responsive_tries: 120,
            status_wait: 60,
            clock_sync_tries: 20,
            ssh_retries: 30,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Parallels executor for one job.
pub struct ParallelsExecutor {
    hypervisor: Arc<dyn Hypervisor>,
    shell: Option<Arc<dyn RemoteShell>>,
    timings: Timings,
    runner: Option<RunnerConfig>,
    job: Option<Job>,
    vm: Option<VmHandle>,
    task: Option<JoinHandle<()>>,
}

impl ParallelsExecutor {
    /// Create an executor driving `prlctl` and the system SSH client.
    pub fn new() -> Self {
        Self {
            hypervisor: Arc::new(Prlctl::new()),
            shell: None,
            timings: Timings::default(),
            runner: None,
            job: None,
            vm: None,
            task: None,
        }
    }

    /// Create with custom hypervisor and shell backends.
    pub fn with_backends(hypervisor: Arc<dyn Hypervisor>, shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            hypervisor,
            shell: Some(shell),
            ..Self::new()
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// The runner VM, once its name is known.
    pub fn vm(&self) -> Option<&VmHandle> {
        self.vm.as_ref()
    }

    fn context(&self) -> Result<(&RunnerConfig, &ParallelsConfig, &Job)> {
        match (&self.runner, &self.job) {
            (Some(runner), Some(job)) => Ok((runner, runner.parallels()?, job)),
            _ => Err(Error::Internal("parallels executor is not prepared".to_string())),
        }
    }

    fn vm_name(&self) -> Result<String> {
        self.vm
            .as_ref()
            .map(|vm| vm.name.clone())
            .ok_or_else(|| Error::Internal("no runner VM selected".to_string()))
    }

    fn vm_mut(&mut self) -> Result<&mut VmHandle> {
        self.vm
            .as_mut()
            .ok_or_else(|| Error::Internal("no runner VM selected".to_string()))
    }

    fn shell(&self) -> Result<Arc<dyn RemoteShell>> {
        self.shell
            .clone()
            .ok_or_else(|| Error::Internal("no remote shell configured".to_string()))
    }

    /// Clone a fresh runner VM from the template and boot it.
    async fn create_vm(&mut self) -> Result<()> {
        let (_, parallels, job) = self.context()?;
        if parallels.base_name.is_empty() {
            return Err(Error::Provisioning(
                "missing base name in parallels configuration".to_string(),
            ));
        }
        let base = parallels.base_name.clone();
        let template = parallels.template_name();
        let log = job.log.clone();
        let name = self.vm_name()?;

        if !self.hypervisor.exists(&template).await {
            info!(base = %base, template = %template, "Creating template");
            log.system(format!("Creating template {} from VM {} ...", template, base));
            self.hypervisor.create_template(&base, &template).await?;
        }

        debug!(vm = %name, template = %template, "Creating runner VM");
        self.hypervisor.create_vm(&name, &template).await?;

        debug!(vm = %name, "Booting VM");
        self.hypervisor.start(&name).await?;

        debug!(vm = %name, "Waiting for guest tools");
        self.try_exec(&name, self.timings.responsive_tries, &["exit", "0"])
            .await?;

        self.verify_machine().await
    }

    async fn restore_from_snapshot(&self) -> Result<()> {
        let name = self.vm_name()?;
        let snapshot = self.hypervisor.default_snapshot(&name).await?;
        debug!(vm = %name, snapshot = %snapshot, "Reverting to snapshot");
        self.hypervisor.revert_to_snapshot(&name, &snapshot).await
    }

    /// Run a guest command until it succeeds, at most `tries` times.
    async fn try_exec(&self, name: &str, tries: u32, args: &[&str]) -> Result<()> {
        let mut last_error = None;
        for attempt in 0..tries {
            if attempt > 0 {
                tokio::time::sleep(self.timings.poll_interval).await;
            }
            match self.hypervisor.exec(name, args).await {
                Ok(()) => return Ok(()),
                Err(e) => last_error = Some(e),
            }
        }

        Err(Error::Timeout(format!(
            "'{}' did not succeed on {} after {} tries{}",
            args.join(" "),
            name,
            tries,
            last_error.map(|e| format!(": {}", e)).unwrap_or_default()
        )))
    }

    /// Poll once per interval until the VM reports `want`.
    async fn wait_for_status(&self, name: &str, want: VmStatus, seconds: u32) -> Result<()> {
        for attempt in 0..seconds {
            if attempt > 0 {
                tokio::time::sleep(self.timings.poll_interval).await;
            }
            if self.hypervisor.status(name).await? == want {
                return Ok(());
            }
        }
        Err(Error::Timeout(format!(
            "VM {} did not become {} within {} seconds",
            name, want, seconds
        )))
    }

    /// Resolve the VM's address. The MAC and the first address found are
    /// cached for the rest of the job.
    async fn wait_for_ip_address(&mut self, seconds: u32) -> Result<String> {
        let hypervisor = self.hypervisor.clone();
        let poll_interval = self.timings.poll_interval;
        let vm = self.vm_mut()?;

        if let Some(ip) = &vm.ip_address {
            return Ok(ip.clone());
        }

        let mac = match &vm.mac_address {
            Some(mac) => mac.clone(),
            None => {
                debug!(vm = %vm.name, "Looking up MAC address");
                let mac = hypervisor.mac_address(&vm.name).await?;
                vm.mac_address = Some(mac.clone());
                mac
            }
        };

        debug!(vm = %vm.name, mac = %mac, "Requesting IP address");
        let mut last_error = None;
        for attempt in 0..seconds {
            if attempt > 0 {
                tokio::time::sleep(poll_interval).await;
            }
            match hypervisor.ip_address(&mac).await {
                Ok(ip) => {
                    debug!(vm = %vm.name, ip = %ip, "IP address found");
                    vm.ip_address = Some(ip.clone());
                    return Ok(ip);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(Error::Timeout(format!(
            "no IP address for VM {} within {} seconds{}",
            vm.name,
            seconds,
            last_error.map(|e| format!(": {}", e)).unwrap_or_default()
        )))
    }

    /// One SSH round trip per executor; later calls return immediately.
    async fn verify_machine(&mut self) -> Result<()> {
        if self.vm.as_ref().is_some_and(|vm| vm.verified) {
            return Ok(());
        }

        let ip = self.wait_for_ip_address(self.timings.verify_ip_wait).await?;
        let (_, _, job) = self.context()?;
        let log = job.log.clone();

        debug!(ip = %ip, "Connecting to SSH");
        let mut session = self.shell()?.connect(&ip, self.timings.ssh_retries).await?;
        session
            .run(&RemoteCommand::new("exit 0"), &log)
            .await
            .map_err(|e| Error::Provisioning(format!("SSH verification failed: {}", e)))?;

        self.vm_mut()?.verified = true;
        Ok(())
    }

    /// Bring the VM into a known-good running state for the job.
    async fn provision(&mut self) -> Result<()> {
        let (_, parallels, job) = self.context()?;
        let disable_snapshots = parallels.disable_snapshots;
        let name = if disable_snapshots {
            format!("{}-{}", parallels.base_name, job.project_runner_name)
        } else {
            job.runner_name.clone()
        };

        if disable_snapshots && self.hypervisor.exists(&name).await {
            debug!(vm = %name, "Deleting old VM");
            if let Err(e) = self.hypervisor.stop(&name).await {
                debug!(vm = %name, error = %e, "Failed to stop old VM");
            }
            if let Err(e) = self.hypervisor.delete(&name).await {
                warn!(vm = %name, error = %e, "Failed to delete old VM");
            }
        }

        self.vm = Some(VmHandle::new(name.clone()));

        if self.hypervisor.exists(&name).await {
            debug!(vm = %name, "Restoring VM from snapshot");
            self.restore_from_snapshot().await?;
        } else {
            debug!(vm = %name, "Creating new VM");
            self.create_vm().await?;

            if !disable_snapshots {
                debug!(vm = %name, "Creating baseline snapshot");
                self.hypervisor
                    .create_snapshot(&name, BASELINE_SNAPSHOT)
                    .await?;
            }
        }

        let status = self.hypervisor.status(&name).await?;
        debug!(vm = %name, status = %status, "Checked VM status");
        if matches!(status, VmStatus::Stopped | VmStatus::Suspended) {
            debug!(vm = %name, "Starting VM");
            self.hypervisor.start(&name).await?;
        }
        if status != VmStatus::Running {
            self.wait_for_status(&name, VmStatus::Running, self.timings.status_wait)
                .await?;
        }

        self.verify_machine().await?;
        self.vm_mut()?.provisioned = true;

        debug!(vm = %name, "Syncing guest clock");
        self.try_exec(
            &name,
            self.timings.clock_sync_tries,
            &["sudo", "ntpdate", "-u", NTP_SERVER],
        )
        .await
    }
}

impl Default for ParallelsExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ParallelsExecutor {
    fn name(&self) -> &'static str {
        "parallels"
    }

    async fn prepare(&mut self, config: &RunnerConfig, job: &Job) -> Result<()> {
        self.runner = Some(config.clone());
        self.job = Some(job.clone());

        let ssh = config.ssh()?.clone();
        let parallels = config.parallels()?;
        if parallels.base_name.is_empty() {
            return Err(Error::Config(
                "missing base name in parallels configuration".to_string(),
            ));
        }

        if self.shell.is_none() {
            self.shell = Some(Arc::new(OpenSsh::new(ssh)));
        }

        let version = self
            .hypervisor
            .version()
            .await
            .map_err(|e| Error::Connection(format!("parallels unavailable: {}", e)))?;

        info!(job_id = %job.id, version = %version, base = %parallels.base_name, "Using Parallels executor");
        job.log
            .system(format!("Using Parallels {} executor ...", version));

        self.provision().await
    }

    async fn start(&mut self) -> Result<Completion> {
        let ip = self.wait_for_ip_address(self.timings.start_ip_wait).await?;
        let (runner, _, job) = self.context()?;

        let command = RemoteCommand {
            command: "bash".to_string(),
            env: job.merged_env(&runner.environment),
            stdin: Some(job.script.clone()),
        };
        let log = job.log.clone();

        debug!(ip = %ip, "Connecting to SSH server");
        let mut session = self.shell()?.connect(&ip, 0).await?;

        let (tx, completion) = Completion::channel();
        self.task = Some(tokio::spawn(async move {
            let result = session.run(&command, &log).await;
            debug!(ok = result.is_ok(), "SSH command finished");
            tx.finish(result);
        }));

        Ok(completion)
    }

    async fn cleanup(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let Some(vm) = self.vm.take() else {
            return;
        };
        let delete = !vm.provisioned
            || self
                .runner
                .as_ref()
                .and_then(|r| r.parallels.as_ref())
                .is_none_or(|p| p.disable_snapshots);

        let mut steps = vec![Teardown::Kill];
        if delete {
            steps.push(Teardown::Delete);
        }

        for step in steps {
            let result = match step {
                Teardown::Kill => self.hypervisor.kill(&vm.name).await,
                Teardown::Delete => self.hypervisor.delete(&vm.name).await,
            };
            match result {
                Ok(()) => debug!(vm = %vm.name, step = ?step, "Teardown step done"),
                Err(e) => warn!(vm = %vm.name, step = ?step, error = %e, "Teardown step failed"),
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Teardown {
    Kill,
    Delete,
}
