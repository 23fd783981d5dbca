//! Pipeline document loading.

use anyhow::{bail, Context, Result};
use genesis_core::pipeline::Pipeline;
use std::fs;
use std::path::Path;

/// Read and decode the pipeline document.
///
/// Performs the validation that must happen before any container is
/// created; graph-level checks (unknown dependencies, cycles) live in the
/// DAG builder.
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<Pipeline> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading pipeline document at {}", path.display()))?;

    let pipeline: Pipeline = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing pipeline document at {}", path.display()))?;

    validate(&pipeline)?;
    Ok(pipeline)
}

fn validate(pipeline: &Pipeline) -> Result<()> {
    for step in &pipeline.steps {
        if step.name.trim().is_empty() {
            bail!(
                "pipeline '{}' contains a step with an empty name",
                pipeline.name
            );
        }
        if step.image.trim().is_empty() {
            bail!("step '{}' has an empty image reference", step.name);
        }
    }
    Ok(())
}
