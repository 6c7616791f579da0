// Error types for Surrogate
// Rule-level problems never show up here: invalid patterns and header lines
// degrade to inert rules instead.

use thiserror::Error;

use crate::engine::TransportError;
use crate::profile::ProfileId;

/// Result type alias for Surrogate operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot remove the last profile")]
    LastProfile,

    #[error("profile {0} not found")]
    ProfileNotFound(ProfileId),

    #[error("{list} index {index} out of range (len {len})")]
    IndexOutOfRange {
        list: &'static str,
        index: usize,
        len: usize,
    },

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(u32),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("capture error: {0}")]
    Capture(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("replay pool is shut down")]
    ShutDown,

    #[error("exchange has no response to compare against")]
    MissingResponse,

    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl Error {
    pub(crate) fn out_of_range(list: &'static str, index: usize, len: usize) -> Self {
        Error::IndexOutOfRange { list, index, len }
    }
}
