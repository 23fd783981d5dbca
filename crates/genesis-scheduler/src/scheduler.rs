//! The polling scheduler loop.

use crate::dag::{DagBuilder, PipelineDag};
use crate::machine;
use chrono::Utc;
use genesis_core::pipeline::Pipeline;
use genesis_core::ports::ContainerEngine;
use genesis_core::run::{RunReport, StepOutcome, StepState};
use genesis_core::{Error, Result};
use petgraph::graph::NodeIndex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default pause between scheduler cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Drives a pipeline DAG to completion against a container engine.
///
/// Single-threaded and cooperative: nodes are advanced sequentially within
/// a cycle, parents before children, so a child always sees this cycle's
/// parent states. Independent steps still overlap in time because their
/// containers run concurrently.
pub struct Scheduler {
    engine: Arc<dyn ContainerEngine>,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the pause between cycles.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Execute the pipeline until every step reaches a terminal state.
    ///
    /// Construction problems (duplicate names, unknown dependencies,
    /// cycles) fail here before any container is created. Once containers
    /// exist, every one of them is removed by the time this returns, the
    /// abort path included.
    pub async fn run(&self, pipeline: &Pipeline) -> Result<RunReport> {
        let queued_at = Utc::now();

        let mut dag = DagBuilder::new()
            .build(pipeline)
            .map_err(|e| Error::InvalidPipeline(e.to_string()))?;
        let order = dag
            .topological_order()
            .map_err(|e| Error::InvalidPipeline(e.to_string()))?;

        let workspace = workspace_path(pipeline)?;
        info!(
            pipeline = %pipeline.name,
            steps = dag.node_count(),
            workspace = %workspace.display(),
            "Starting pipeline run"
        );

        if let Err(e) = self.drive(&mut dag, &order, &workspace).await {
            self.sweep(&dag).await;
            return Err(e);
        }

        let completed_at = Utc::now();
        let steps = order
            .iter()
            .map(|&idx| {
                let node = dag.node(idx);
                StepOutcome {
                    name: node.name.clone(),
                    state: node.state,
                }
            })
            .collect();

        Ok(RunReport {
            pipeline_name: pipeline.name.clone(),
            queued_at,
            completed_at,
            duration_ms: (completed_at - queued_at).num_milliseconds().max(0) as u64,
            steps,
        })
    }

    async fn drive(
        &self,
        dag: &mut PipelineDag,
        order: &[NodeIndex],
        workspace: &Path,
    ) -> Result<()> {
        loop {
            for &idx in order {
                machine::advance(dag, idx, self.engine.as_ref(), workspace).await?;
                let node = dag.node(idx);
                info!("Step {} has state {}", node.name, node.state);
            }

            if dag.nodes().all(|n| n.state.is_terminal()) {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Reap containers still alive when a run aborts mid-cycle.
    async fn sweep(&self, dag: &PipelineDag) {
        for node in dag.nodes() {
            if node.state != StepState::Running {
                continue;
            }
            if let Some(container) = &node.container_id {
                if let Err(e) = self.engine.remove(container).await {
                    warn!(
                        step = %node.name,
                        container = %container,
                        error = %e,
                        "Failed to remove container while aborting"
                    );
                }
            }
        }
    }
}

fn workspace_path(pipeline: &Pipeline) -> Result<PathBuf> {
    match pipeline.mount.as_deref() {
        Some(mount) if !mount.is_empty() => Ok(PathBuf::from(mount)),
        _ => Ok(std::env::current_dir()?),
    }
}
