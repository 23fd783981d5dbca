//! Genesis Core
//!
//! Core domain types, traits, and error handling for genesis.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the scheduler, the container runtime adapter, and the CLI.

pub mod error;
pub mod ids;
pub mod pipeline;
pub mod ports;
pub mod run;

pub use error::{Error, Result};
pub use ids::NodeId;
