//! Error types for the replication engine.

use thiserror::Error;

/// Errors that can occur inside the replication engine.
///
/// Client-visible outcomes such as `ConflictingType` or a replication
/// timeout are not errors in this sense: they are reply variants of the
/// operation protocol (see [`crate::messages`]). `ReplError` covers the
/// cases where the engine itself cannot proceed.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Envelope or message (de)serialization failed.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// The engine task has stopped and the command channel is closed.
    #[error("replicator shut down")]
    Shutdown,

    /// A reply channel was dropped before the engine answered.
    #[error("reply channel closed before a reply arrived")]
    ReplyDropped,
}
