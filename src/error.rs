//! Chunk master error abstractions.

use thiserror::Error;

use crate::models::{ChunkId, NodeId};

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";

/// Application error variants.
///
/// These are the errors which are returned synchronously to callers at the mutation boundary.
/// Divergence between desired & actual replica state is never surfaced through this type.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The request requires the leader, and this master is not currently the leader.
    #[error("this master is not the leader, current role is {0}")]
    NotLeader(String),
    /// The target chunk does not exist.
    #[error("no such chunk {0}")]
    ChunkNotFound(ChunkId),
    /// The target node does not exist.
    #[error("no such node {0}")]
    NodeNotFound(NodeId),
    /// The server has hit an internal error, but will remain online.
    #[error("internal server error")]
    Ise(anyhow::Error),
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;

/// A result type used for responses to callers of the master.
pub type AppResult<T> = ::std::result::Result<T, AppError>;
