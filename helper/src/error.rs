//! Errors surfaced by sessions, the registry and participant links.

use thiserror::Error;

use crate::proto::ProtoError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("identity '{0}' is already connected")]
    DuplicateIdentity(String),
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The outbound queue of a session is gone; its read loop reaps it.
    #[error("channel to '{0}' is closed")]
    ChannelClosed(String),
    /// The peer is not draining its outbound queue.
    #[error("outbound queue to '{0}' is full")]
    QueueFull(String),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = SyncError> = core::result::Result<T, E>;
