//! Persistence error types.

use knob_common::config::ConfigError;
use thiserror::Error;

/// Error types for loading and saving knob documents.
#[derive(Debug, Error)]
pub enum StoreError {
    /// File could not be read or written.
    #[error("Document I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The document file was missing or not valid TOML.
    #[error(transparent)]
    Parse(#[from] ConfigError),

    /// The document could not be serialized to TOML.
    #[error("Failed to serialize document: {0}")]
    Serialize(String),
}
