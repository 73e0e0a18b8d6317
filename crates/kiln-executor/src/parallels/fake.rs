//! In-memory hypervisor and shell for executor tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kiln_core::log::LogSink;
use kiln_core::{Error, Result};

use super::prlctl::{Hypervisor, VmStatus};
use super::ssh::{RemoteCommand, RemoteShell, ShellSession};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Version,
    CreateTemplate(String),
    CreateVm(String),
    Start(String),
    Stop(String),
    Kill(String),
    Delete(String),
    Exec(String, String),
    Mac(String),
    Ip(String),
    DefaultSnapshot(String),
    Revert(String, String),
    Snapshot(String, String),
}

#[derive(Default)]
struct Vm {
    status: Option<VmStatus>,
    snapshots: Vec<String>,
}

#[derive(Default)]
struct HvState {
    unavailable: bool,
    vms: HashMap<String, Vm>,
    /// Lookups that fail before the lease appears.
    ip_misses: u32,
    /// Failing execs before the guest answers.
    exec_misses: u32,
    /// Guest commands starting with this always fail.
    failing_exec: Option<String>,
    stuck_status: Option<VmStatus>,
    calls: Vec<Call>,
}

#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<HvState>,
}

impl FakeHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with<T>(&self, f: impl FnOnce(&mut HvState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_unavailable(&self) {
        self.with(|s| s.unavailable = true);
    }

    pub fn add_vm(&self, name: &str, status: VmStatus) {
        self.with(|s| {
            s.vms.insert(
                name.to_string(),
                Vm {
                    status: Some(status),
                    snapshots: Vec::new(),
                },
            );
        });
    }

    pub fn add_snapshot(&self, name: &str, id: &str) {
        self.with(|s| {
            if let Some(vm) = s.vms.get_mut(name) {
                vm.snapshots.push(id.to_string());
            }
        });
    }

    pub fn set_ip_misses(&self, misses: u32) {
        self.with(|s| s.ip_misses = misses);
    }

    pub fn set_exec_misses(&self, misses: u32) {
        self.with(|s| s.exec_misses = misses);
    }

    pub fn fail_exec(&self, prefix: &str) {
        self.with(|s| s.failing_exec = Some(prefix.to_string()));
    }

    /// Report this status no matter what happens to the VM.
    pub fn stick_status(&self, status: VmStatus) {
        self.with(|s| s.stuck_status = Some(status));
    }

    pub fn has_vm(&self, name: &str) -> bool {
        self.with(|s| s.vms.contains_key(name))
    }

    pub fn status_of(&self, name: &str) -> Option<VmStatus> {
        self.with(|s| s.vms.get(name).and_then(|vm| vm.status.clone()))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with(|s| s.calls.clear());
    }

    fn set_status(&self, name: &str, status: VmStatus) -> Result<()> {
        self.with(|s| match s.vms.get_mut(name) {
            Some(vm) => {
                vm.status = Some(status);
                Ok(())
            }
            None => Err(Error::Provisioning(format!("unknown VM {}", name))),
        })
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn version(&self) -> Result<String> {
        self.with(|s| {
            s.calls.push(Call::Version);
            if s.unavailable {
                Err(Error::Provisioning("prlctl: command not found".to_string()))
            } else {
                Ok("19.1.0 (54729)".to_string())
            }
        })
    }

    async fn exists(&self, name: &str) -> bool {
        self.has_vm(name)
    }

    async fn create_template(&self, base: &str, template: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(Call::CreateTemplate(template.to_string()));
            if !s.vms.contains_key(base) {
                return Err(Error::Provisioning(format!("unknown VM {}", base)));
            }
            s.vms.insert(
                template.to_string(),
                Vm {
                    status: Some(VmStatus::Stopped),
                    snapshots: Vec::new(),
                },
            );
            Ok(())
        })
    }

    async fn create_vm(&self, name: &str, template: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(Call::CreateVm(name.to_string()));
            if !s.vms.contains_key(template) {
                return Err(Error::Provisioning(format!("unknown template {}", template)));
            }
            if s.vms.contains_key(name) {
                return Err(Error::Provisioning(format!("VM {} already exists", name)));
            }
            s.vms.insert(
                name.to_string(),
                Vm {
                    status: Some(VmStatus::Stopped),
                    snapshots: Vec::new(),
                },
            );
            Ok(())
        })
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.with(|s| s.calls.push(Call::Start(name.to_string())));
        self.set_status(name, VmStatus::Running)
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.with(|s| s.calls.push(Call::Stop(name.to_string())));
        self.set_status(name, VmStatus::Stopped)
    }

    async fn kill(&self, name: &str) -> Result<()> {
        self.with(|s| s.calls.push(Call::Kill(name.to_string())));
        self.set_status(name, VmStatus::Stopped)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(Call::Delete(name.to_string()));
            s.vms
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| Error::Provisioning(format!("unknown VM {}", name)))
        })
    }

    async fn status(&self, name: &str) -> Result<VmStatus> {
        self.with(|s| {
            if let Some(status) = &s.stuck_status {
                return Ok(status.clone());
            }
            s.vms
                .get(name)
                .and_then(|vm| vm.status.clone())
                .ok_or_else(|| Error::Provisioning(format!("unknown VM {}", name)))
        })
    }

    async fn exec(&self, name: &str, args: &[&str]) -> Result<()> {
        self.with(|s| {
            let command = args.join(" ");
            s.calls.push(Call::Exec(name.to_string(), command.clone()));
            if s
                .failing_exec
                .as_deref()
                .is_some_and(|prefix| command.starts_with(prefix))
            {
                return Err(Error::Provisioning(format!("{}: command failed", command)));
            }
            if s.exec_misses > 0 {
                s.exec_misses -= 1;
                return Err(Error::Provisioning("guest tools not running".to_string()));
            }
            Ok(())
        })
    }

    async fn mac_address(&self, name: &str) -> Result<String> {
        self.with(|s| s.calls.push(Call::Mac(name.to_string())));
        Ok("001c42b4f1e5".to_string())
    }

    async fn ip_address(&self, mac: &str) -> Result<String> {
        self.with(|s| {
            s.calls.push(Call::Ip(mac.to_string()));
            if s.ip_misses > 0 {
                s.ip_misses -= 1;
                return Err(Error::Provisioning(format!("no DHCP lease for MAC {}", mac)));
            }
            Ok("10.211.55.9".to_string())
        })
    }

    async fn default_snapshot(&self, name: &str) -> Result<String> {
        self.with(|s| {
            s.calls.push(Call::DefaultSnapshot(name.to_string()));
            s.vms
                .get(name)
                .and_then(|vm| vm.snapshots.last().cloned())
                .ok_or_else(|| Error::Provisioning(format!("VM {} has no current snapshot", name)))
        })
    }

    async fn revert_to_snapshot(&self, name: &str, snapshot_id: &str) -> Result<()> {
        self.with(|s| {
            s.calls
                .push(Call::Revert(name.to_string(), snapshot_id.to_string()))
        });
        self.set_status(name, VmStatus::Stopped)
    }

    async fn create_snapshot(&self, name: &str, snapshot_name: &str) -> Result<()> {
        self.with(|s| {
            s.calls
                .push(Call::Snapshot(name.to_string(), snapshot_name.to_string()));
            match s.vms.get_mut(name) {
                Some(vm) => {
                    vm.snapshots.push(format!("{{{}}}", snapshot_name));
                    Ok(())
                }
                None => Err(Error::Provisioning(format!("unknown VM {}", name))),
            }
        })
    }
}

#[derive(Default)]
struct ShellState {
    /// Connect attempts that fail before the host answers.
    connect_misses: u32,
    exit_code: Option<i32>,
    output: String,
    connects: Vec<(String, u32)>,
    commands: Vec<RemoteCommand>,
    /// Block every `bash` run until the session is dropped.
    hang: bool,
}

#[derive(Default)]
pub struct FakeShell {
    state: Arc<Mutex<ShellState>>,
}

impl FakeShell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with<T>(&self, f: impl FnOnce(&mut ShellState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_connect_misses(&self, misses: u32) {
        self.with(|s| s.connect_misses = misses);
    }

    /// Exit code of the job script.
    pub fn set_exit_code(&self, code: i32) {
        self.with(|s| s.exit_code = Some(code));
    }

    pub fn set_output(&self, output: &str) {
        self.with(|s| s.output = output.to_string());
    }

    pub fn hang(&self) {
        self.with(|s| s.hang = true);
    }

    /// `(host, retries)` of every connect.
    pub fn connects(&self) -> Vec<(String, u32)> {
        self.with(|s| s.connects.clone())
    }

    pub fn commands(&self) -> Vec<RemoteCommand> {
        self.with(|s| s.commands.clone())
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn connect(&self, host: &str, retries: u32) -> Result<Box<dyn ShellSession>> {
        self.with(|s| {
            s.connects.push((host.to_string(), retries));
            if s.connect_misses > retries {
                s.connect_misses -= retries + 1;
                return Err(Error::Timeout(format!("SSH to {} not available", host)));
            }
            s.connect_misses = 0;
            Ok(())
        })?;

        Ok(Box::new(FakeSession {
            state: self.state.clone(),
        }))
    }
}

struct FakeSession {
    state: Arc<Mutex<ShellState>>,
}

#[async_trait]
impl ShellSession for FakeSession {
    async fn run(&mut self, command: &RemoteCommand, log: &LogSink) -> Result<()> {
        let (hang, output, exit_code) = {
            let mut s = self.state.lock().unwrap();
            s.commands.push(command.clone());
            (s.hang, s.output.clone(), s.exit_code)
        };

        if command.command != "bash" {
            return Ok(());
        }
        if hang {
            std::future::pending::<()>().await;
        }

        log.stdout(output);
        match exit_code {
            None | Some(0) => Ok(()),
            Some(code) => Err(Error::RemoteExecution {
                exit_code: Some(code),
                message: format!("bash exited with code {}", code),
            }),
        }
    }
}
