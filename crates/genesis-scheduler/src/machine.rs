//! Per-node transition function.
//!
//! Each scheduler cycle applies this to every node in topological order:
//! a waiting node dispatches once every parent has succeeded, collapses to
//! cancelled below any failure, and a running node is observed for
//! completion. Terminal states never change.

use crate::dag::PipelineDag;
use genesis_core::ports::{ContainerEngine, ContainerObservation, ContainerSpec};
use genesis_core::run::StepState;
use genesis_core::{Error, Result};
use petgraph::graph::NodeIndex;
use std::path::Path;
use tracing::{debug, info, warn};

pub(crate) async fn advance(
    dag: &mut PipelineDag,
    idx: NodeIndex,
    engine: &dyn ContainerEngine,
    workspace: &Path,
) -> Result<()> {
    match dag.node(idx).state {
        StepState::Waiting => advance_waiting(dag, idx, engine, workspace).await,
        StepState::Running => advance_running(dag, idx, engine).await,
        StepState::Succeeded | StepState::Failed | StepState::Cancelled => Ok(()),
    }
}

async fn advance_waiting(
    dag: &mut PipelineDag,
    idx: NodeIndex,
    engine: &dyn ContainerEngine,
    workspace: &Path,
) -> Result<()> {
    let parent_states = dag.parent_states(idx);

    // A failed or cancelled ancestor wins over dispatch.
    if parent_states
        .iter()
        .any(|s| matches!(s, StepState::Failed | StepState::Cancelled))
    {
        info!(step = %dag.node(idx).name, "Cancelling step");
        // A waiting node should never own a container, but reap defensively.
        if let Some(container) = dag.node(idx).container_id.clone() {
            remove_container(engine, &container, &dag.node(idx).name).await;
        }
        dag.node_mut(idx).state = StepState::Cancelled;
        return Ok(());
    }

    if !parent_states.iter().all(|s| *s == StepState::Succeeded) {
        return Ok(());
    }

    dispatch(dag, idx, engine, workspace).await
}

/// Create and start the node's container. Start failure marks the node
/// failed; create failure aborts the whole run.
async fn dispatch(
    dag: &mut PipelineDag,
    idx: NodeIndex,
    engine: &dyn ContainerEngine,
    workspace: &Path,
) -> Result<()> {
    let spec = {
        let node = dag.node(idx);
        ContainerSpec {
            name: node.id.to_string(),
            image: node.image.clone(),
            command: node.argv(),
            env: node.environment.clone(),
            workspace: workspace.to_path_buf(),
            ports: node.ports.clone(),
        }
    };

    info!(step = %dag.node(idx).name, image = %spec.image, "Dispatching step");

    let container = engine.create(&spec).await?;
    dag.node_mut(idx).container_id = Some(container.clone());

    match engine.start(&container).await {
        Ok(()) => {
            debug!(
                step = %dag.node(idx).name,
                container = %container,
                "Step container started"
            );
            dag.node_mut(idx).state = StepState::Running;
        }
        Err(e) => {
            warn!(
                step = %dag.node(idx).name,
                error = %e,
                "Step container failed to start"
            );
            remove_container(engine, &container, &dag.node(idx).name).await;
            dag.node_mut(idx).state = StepState::Failed;
        }
    }
    Ok(())
}

async fn advance_running(
    dag: &mut PipelineDag,
    idx: NodeIndex,
    engine: &dyn ContainerEngine,
) -> Result<()> {
    let (name, container) = {
        let node = dag.node(idx);
        match &node.container_id {
            Some(c) => (node.name.clone(), c.clone()),
            None => {
                return Err(Error::Internal(format!(
                    "running step '{}' has no container",
                    node.name
                )));
            }
        }
    };

    let observation = match engine.inspect(&container).await {
        Ok(observation) => observation,
        Err(e) => {
            // Transient engine failure: stay running, retry next cycle.
            warn!(
                step = %name,
                container = %container,
                error = %e,
                "Container inspect failed"
            );
            return Ok(());
        }
    };

    let exit_code = match observation {
        ContainerObservation::Running => return Ok(()),
        ContainerObservation::Exited { exit_code } => exit_code,
    };

    // Drain logs before the container is reaped.
    if let Err(e) = engine.stream_logs(&container).await {
        warn!(step = %name, error = %e, "Failed to stream container logs");
    }
    remove_container(engine, &container, &name).await;

    if exit_code == 0 {
        dag.node_mut(idx).state = StepState::Succeeded;
    } else {
        warn!(step = %name, exit_code, "Step exited non-zero");
        dag.node_mut(idx).state = StepState::Failed;
    }
    Ok(())
}

/// Best-effort removal; a failure is logged and never blocks progress.
async fn remove_container(engine: &dyn ContainerEngine, container: &str, step: &str) {
    if let Err(e) = engine.remove(container).await {
        warn!(
            step = %step,
            container = %container,
            error = %e,
            "Failed to remove container"
        );
    }
}
