//! Core domain types and traits for kiln CI job runners.
//!
//! This crate contains:
//! - Job identifiers and the job description handed to executors
//! - Runner configuration types shared by every backend
//! - Environment handles (images, containers, VMs, cache binds)
//! - The executor contract and its one-shot completion signal
//! - The job log sink

pub mod config;
pub mod error;
pub mod executor;
pub mod handle;
pub mod id;
pub mod job;
pub mod log;

pub use error::{Error, Result};
pub use id::JobId;
