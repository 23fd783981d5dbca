//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML document.
//! They are immutable after load; the scheduler works on the graph
//! representation built from them.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Pipeline {
    pub name: String,
    /// Absolute host path bound into every step container as the shared
    /// working directory. Empty or absent means the process working
    /// directory.
    #[serde(default)]
    pub mount: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    /// Unique within the pipeline. The name `root` marks the step as the
    /// graph root, overriding the synthesized one.
    pub name: String,
    /// Container image reference.
    pub image: String,
    /// Whitespace-separated command tokens; absent or empty means the
    /// image's default entrypoint.
    #[serde(default)]
    pub command: Option<String>,
    /// Names of steps that must succeed before this one dispatches.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// `KEY=VALUE` pairs passed as the container environment.
    #[serde(default)]
    pub environment: Vec<String>,
    /// Host port bindings for this step's container.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PortMapping {
    /// Port inside the container.
    pub container: u16,
    /// Host port it is published on.
    pub host: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}
