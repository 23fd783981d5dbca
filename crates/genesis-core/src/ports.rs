//! Port traits (hexagonal architecture).
//!
//! These traits define the interface between the scheduler core and the
//! container runtime adapter.

use crate::pipeline::PortMapping;
use crate::Result;
use async_trait::async_trait;
use std::path::PathBuf;

/// Parameters for creating one step container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name; the scheduler passes the node id here so containers
    /// can be correlated back to steps.
    pub name: String,
    /// Container image reference.
    pub image: String,
    /// Command argv; empty means the image's default entrypoint.
    pub command: Vec<String>,
    /// `KEY=VALUE` environment pairs.
    pub env: Vec<String>,
    /// Host path bound into the container as the shared working directory.
    pub workspace: PathBuf,
    /// Host port bindings.
    pub ports: Vec<PortMapping>,
}

/// Engine view of a dispatched container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerObservation {
    /// Anything the engine reports short of an exit.
    Running,
    Exited { exit_code: i64 },
}

/// Local container runtime the scheduler drives.
///
/// The scheduler only ever calls this serially; implementations need no
/// synchronization beyond what that access pattern requires.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create a container. A create failure indicates a configuration
    /// problem (a missing image, say) and aborts the run.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a created container.
    async fn start(&self, id: &str) -> Result<()>;

    /// Report whether the container is still running or has exited.
    async fn inspect(&self, id: &str) -> Result<ContainerObservation>;

    /// Stream the container's combined stdout and stderr to the log sink.
    /// Bounded by a short deadline so a slow engine cannot stall a cycle.
    async fn stream_logs(&self, id: &str) -> Result<()>;

    /// Force-remove the container together with its anonymous volumes.
    async fn remove(&self, id: &str) -> Result<()>;
}
