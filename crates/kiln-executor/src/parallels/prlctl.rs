//! Hypervisor control through the `prlctl` command line tool.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use kiln_core::{Error, Result};
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

const DEFAULT_LEASES_FILE: &str = "/Library/Preferences/Parallels/parallels_dhcp_leases";

static MAC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"mac=([0-9A-Fa-f]{12})").expect("valid regex"));
static SNAPSHOT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\{([^}]+)\}").expect("valid regex"));

/// Power state reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmStatus {
    Running,
    Stopped,
    Suspended,
    Other(String),
}

impl VmStatus {
    pub fn parse(output: &str) -> Self {
        match output.trim() {
            "running" => VmStatus::Running,
            "stopped" => VmStatus::Stopped,
            "suspended" => VmStatus::Suspended,
            other => VmStatus::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmStatus::Running => f.write_str("running"),
            VmStatus::Stopped => f.write_str("stopped"),
            VmStatus::Suspended => f.write_str("suspended"),
            VmStatus::Other(other) => f.write_str(other),
        }
    }
}

/// Operations the VM executor needs from a hypervisor.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn version(&self) -> Result<String>;

    async fn exists(&self, name: &str) -> bool;

    /// Clone `base` into a template named `template`.
    async fn create_template(&self, base: &str, template: &str) -> Result<()>;

    /// Create a VM from a template.
    async fn create_vm(&self, name: &str, template: &str) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    /// Power off without a guest shutdown.
    async fn kill(&self, name: &str) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    async fn status(&self, name: &str) -> Result<VmStatus>;

    /// Run a command in the guest through the guest agent.
    async fn exec(&self, name: &str, args: &[&str]) -> Result<()>;

    /// MAC address of the primary adapter, 12 lowercase hex digits.
    async fn mac_address(&self, name: &str) -> Result<String>;

    /// IP address leased to `mac`.
    async fn ip_address(&self, mac: &str) -> Result<String>;

    /// Id of the snapshot the VM currently sits on.
    async fn default_snapshot(&self, name: &str) -> Result<String>;

    async fn revert_to_snapshot(&self, name: &str, snapshot_id: &str) -> Result<()>;

    async fn create_snapshot(&self, name: &str, snapshot_name: &str) -> Result<()>;
}

/// [`Hypervisor`] backed by Parallels Desktop's `prlctl`.
pub struct Prlctl {
    bin: String,
    leases_file: PathBuf,
}

impl Default for Prlctl {
    fn default() -> Self {
        Self::new()
    }
}

impl Prlctl {
    /// Uses `KILN_PRLCTL` and `KILN_PARALLELS_LEASES` when set.
    pub fn new() -> Self {
        let bin = std::env::var("KILN_PRLCTL").unwrap_or_else(|_| "prlctl".to_string());
        let leases_file = std::env::var("KILN_PARALLELS_LEASES")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_LEASES_FILE));
        Self { bin, leases_file }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(args = ?args, "Running prlctl");
        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Provisioning(format!("failed to run {}: {}", self.bin, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Provisioning(format!(
                "prlctl {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Hypervisor for Prlctl {
    async fn version(&self) -> Result<String> {
        let output = self.run(&["--version"]).await?;
        parse_version(&output)
    }

    async fn exists(&self, name: &str) -> bool {
        self.run(&["list", name, "--no-header", "--output", "status"])
            .await
            .is_ok()
    }

    async fn create_template(&self, base: &str, template: &str) -> Result<()> {
        self.run(&["clone", base, "--name", template, "--template"])
            .await
            .map(|_| ())
    }

    async fn create_vm(&self, name: &str, template: &str) -> Result<()> {
        self.run(&["create", name, "--ostemplate", template])
            .await
            .map(|_| ())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.run(&["start", name]).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.run(&["stop", name]).await.map(|_| ())
    }

    async fn kill(&self, name: &str) -> Result<()> {
        self.run(&["stop", name, "--kill"]).await.map(|_| ())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.run(&["delete", name]).await.map(|_| ())
    }

    async fn status(&self, name: &str) -> Result<VmStatus> {
        let output = self
            .run(&["list", name, "--no-header", "--output", "status"])
            .await?;
        Ok(VmStatus::parse(&output))
    }

    async fn exec(&self, name: &str, args: &[&str]) -> Result<()> {
        let mut full = vec!["exec", name];
        full.extend_from_slice(args);
        self.run(&full).await.map(|_| ())
    }

    async fn mac_address(&self, name: &str) -> Result<String> {
        let output = self.run(&["list", "-i", name]).await?;
        parse_mac_address(&output)
            .ok_or_else(|| Error::Provisioning(format!("no MAC address found for VM {}", name)))
    }

    async fn ip_address(&self, mac: &str) -> Result<String> {
        let leases = tokio::fs::read_to_string(&self.leases_file)
            .await
            .map_err(|e| {
                Error::Provisioning(format!(
                    "failed to read {}: {}",
                    self.leases_file.display(),
                    e
                ))
            })?;
        parse_dhcp_lease(&leases, mac)
            .ok_or_else(|| Error::Provisioning(format!("no DHCP lease for MAC {}", mac)))
    }

    async fn default_snapshot(&self, name: &str) -> Result<String> {
        let output = self.run(&["snapshot-list", name]).await?;
        parse_current_snapshot(&output)
            .ok_or_else(|| Error::Provisioning(format!("VM {} has no current snapshot", name)))
    }

    async fn revert_to_snapshot(&self, name: &str, snapshot_id: &str) -> Result<()> {
        self.run(&["snapshot-switch", name, "--id", snapshot_id])
            .await
            .map(|_| ())
    }

    async fn create_snapshot(&self, name: &str, snapshot_name: &str) -> Result<()> {
        self.run(&["snapshot", name, "--name", snapshot_name])
            .await
            .map(|_| ())
    }
}

/// `prlctl version 19.1.0 (54729)` -> `19.1.0 (54729)`.
pub fn parse_version(output: &str) -> Result<String> {
    output
        .trim()
        .strip_prefix("prlctl version ")
        .map(|v| v.trim().to_string())
        .ok_or_else(|| Error::Provisioning(format!("unexpected prlctl version output: {}", output)))
}

/// MAC of the first adapter in `prlctl list -i` output, lowercased.
pub fn parse_mac_address(output: &str) -> Option<String> {
    MAC_RE
        .captures(output)
        .map(|caps| caps[1].to_ascii_lowercase())
}

/// Newest lease for `mac` in the Parallels DHCP lease file, whose lines read
/// `10.211.55.4="1700000000,1800,001c42a2b3c4,01001c42a2b3c4"`.
pub fn parse_dhcp_lease(leases: &str, mac: &str) -> Option<String> {
    let mac = mac.to_ascii_lowercase();
    leases
        .lines()
        .filter_map(|line| {
            let (ip, value) = line.trim().split_once('=')?;
            let fields: Vec<&str> = value.trim_matches('"').split(',').collect();
            let [timestamp, _, lease_mac, ..] = fields.as_slice() else {
                return None;
            };
            if lease_mac.to_ascii_lowercase() != mac {
                return None;
            }
            let timestamp: u64 = timestamp.parse().ok()?;
            Some((timestamp, ip.trim().to_string()))
        })
        .max_by_key(|(timestamp, _)| *timestamp)
        .map(|(_, ip)| ip)
}

/// The snapshot marked current (`*{id}`) in `prlctl snapshot-list` output.
pub fn parse_current_snapshot(output: &str) -> Option<String> {
    SNAPSHOT_RE.captures(output).map(|caps| caps[1].to_string())
}
