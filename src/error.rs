//! Error taxonomy for the cache engine and its remote collaborators.

use thiserror::Error;

use crate::cache::CacheKey;

/// Failure reported by the remote query executor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
  #[error("transport error: {0}")]
  Transport(String),
  #[error("request rejected ({status}): {message}")]
  Rejected { status: u16, message: String },
  #[error("no {table} row with id {id}")]
  NotFound { table: String, id: String },
  #[error("malformed response: {0}")]
  Decode(String),
}

impl RemoteError {
  pub fn transport(message: impl Into<String>) -> Self {
    Self::Transport(message.into())
  }

  pub fn decode(message: impl Into<String>) -> Self {
    Self::Decode(message.into())
  }
}

#[derive(Debug, Error)]
pub enum Error {
  /// Malformed key input. Fatal to the call, never retried.
  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  /// The remote side of an optimistic mutation failed. Rollback has already
  /// been attempted; any keys that could not be restored are listed.
  #[error("{operation} failed: {source}")]
  RemoteMutationFailed {
    operation: String,
    source: RemoteError,
    rollback_failures: Vec<Error>,
  },

  /// A single key could not be restored after a failed mutation.
  #[error("rollback of {key} failed: {reason}")]
  RollbackFailed { key: CacheKey, reason: String },

  #[error("unknown operation: {0}")]
  UnknownOperation(String),

  #[error("cache store error: {0}")]
  Store(String),

  #[error(transparent)]
  Remote(#[from] RemoteError),
}

impl Error {
  pub fn invalid_argument(message: impl Into<String>) -> Self {
    Self::InvalidArgument(message.into())
  }

  pub fn store(message: impl Into<String>) -> Self {
    Self::Store(message.into())
  }

  /// Rollback failures carried by a failed mutation, if any.
  pub fn rollback_failures(&self) -> &[Error] {
    match self {
      Self::RemoteMutationFailed {
        rollback_failures, ..
      } => rollback_failures,
      _ => &[],
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
