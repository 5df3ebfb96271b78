//! Crate-wide error taxonomy.

use std::io;

use thiserror::Error;

use super::NodeId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Broken internal invariant. Surviving is unsafe; the observing worker
    /// must abort.
    #[error("invariant violation: {0}")]
    Invariant(&'static str),

    /// Startup/configuration failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// The very first completion of a CQ failed with retry-exceeded; the
    /// connection attributes are very likely wrong or the remote side is
    /// not in a state to respond.
    #[error("first work completion of queue failed, connection attributes likely wrong")]
    FirstCompletionFailed,

    /// A later completion failed with retry-exceeded; the peer is gone.
    #[error("peer disconnected")]
    Disconnected,

    /// A completion carried a failure status other than retry-exceeded.
    #[error("work completion failed, status {0}")]
    CompletionFailure(u32),

    /// Operation on a queue that was already closed. Expected during
    /// graceful teardown.
    #[error("queue closed")]
    QueueClosed,

    /// The work queue rejected the post (`ENOMEM`).
    #[error("queue full")]
    QueueFull,

    /// Connection creation did not finish within the configured budget.
    #[error("creating connection to node {node_id:#x} timed out after {elapsed_ms} ms")]
    Timeout { node_id: NodeId, elapsed_ms: u64 },

    /// An invalid node id was passed to the public API.
    #[error("invalid node id provided")]
    InvalidNodeId,

    /// Verbs or socket level I/O failure.
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the observing worker must not continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Invariant(_))
    }

    /// Whether this error signals the loss of the remote peer.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::Disconnected)
    }
}
