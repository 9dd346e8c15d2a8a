use std::io;

use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::protocol::{Operation, ProtocolError};

/// Errors surfaced by [`crate::network::Network`].
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A device call failed part way through an operation, so buffer roles
    /// no longer match buffer contents.
    #[error("network is unusable after `{0}` failed; rebuild it")]
    Faulted(Operation),

    #[error("snapshot: {0}")]
    Snapshot(#[from] io::Error),
}

pub type Result<T, E = NetworkError> = std::result::Result<T, E>;
