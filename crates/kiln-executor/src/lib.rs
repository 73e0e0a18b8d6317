//! Job execution backends for kiln runners.
//!
//! Provides executor implementations for running CI jobs:
//! - Docker (build container plus service containers)
//! - Parallels (macOS VMs reached over SSH)

pub mod docker;
pub mod parallels;

pub use docker::DockerExecutor;
pub use kiln_core::config::ExecutorKind;
pub use kiln_core::executor::{Completion, Executor};
pub use parallels::ParallelsExecutor;

/// Create the executor for a configured kind.
pub fn executor_for(kind: ExecutorKind) -> Box<dyn Executor> {
    match kind {
        ExecutorKind::Docker => Box::new(DockerExecutor::new()),
        ExecutorKind::Parallels => Box::new(ParallelsExecutor::new()),
    }
}
