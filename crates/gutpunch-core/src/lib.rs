//! `gutpunch-core` — configuration and error types shared by the scheduler
//! crate and the host binary.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, GutPunchConfig, SchedulerConfig};
pub use error::{GutPunchError, Result};
