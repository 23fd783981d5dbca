//! Pipeline scheduling engine for genesis.
//!
//! Translates a pipeline definition into a DAG of step nodes and drives it
//! to completion against a container engine: steps dispatch once every
//! dependency has succeeded, failure cancels the downstream sub-graph, and
//! every container the run creates is removed before the run returns.

pub mod dag;
mod machine;
pub mod scheduler;

pub use dag::{DagBuilder, DagError, PipelineDag, StepNode};
pub use scheduler::{Scheduler, DEFAULT_POLL_INTERVAL};

#[cfg(test)]
mod scheduler_tests;
