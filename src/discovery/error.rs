//! Discovery error types

use thiserror::Error;

/// Errors that can occur in the discovery subsystem
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("overlay agent error: {0}")]
    Agent(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed discovery document: {0}")]
    Parse(#[from] serde_json::Error),
}
