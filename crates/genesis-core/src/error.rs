//! Error types for genesis.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors; all of these surface before any container runs.
    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    // Engine errors
    #[error("Container engine error: {0}")]
    Engine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
