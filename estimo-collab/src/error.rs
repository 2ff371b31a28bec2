use estimo_core::SharedStateError;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors surfaced by the client side of the replication layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    State(#[from] SharedStateError),
    #[error("could not connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("offline queue is full")]
    QueueFull,
    #[error("spectators cannot submit estimates")]
    Spectating,
}
