//! Handles describing provisioned environments.
//!
//! These are passive records. Executors own them for the lifetime of one job
//! and walk them during cleanup.

use serde::{Deserialize, Serialize};

/// A resolved container image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHandle {
    pub id: String,
    /// Mount points declared by the image itself.
    pub volumes: Vec<String>,
}

/// A created container, build or service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

/// A host directory bound into a container for cache reuse. The host
/// directory outlives the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheVolumeBinding {
    pub host_path: String,
    pub container_path: String,
}

impl CacheVolumeBinding {
    /// Docker bind syntax, always read-write.
    pub fn bind_entry(&self) -> String {
        format!("{}:{}:rw", self.host_path, self.container_path)
    }
}

/// A runner virtual machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHandle {
    pub name: String,
    pub mac_address: Option<String>,
    pub ip_address: Option<String>,
    /// Set once an SSH round trip succeeded; never re-checked afterwards.
    pub verified: bool,
    /// Set once the VM reached a known-good state in this run.
    pub provisioned: bool,
}

impl VmHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}
