//! KDL configuration parsing for kiln runners.
//!
//! A runner file describes one runner: which backend it uses and the
//! per-backend settings (`docker`, `parallels`, `ssh` sections).

pub mod error;
pub mod runner;

pub use error::{ConfigError, ConfigResult};
pub use runner::{load_runner_config, parse_runner_config};
