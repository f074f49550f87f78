//! Error types for sonolink-core.

use crate::clip::{ClipHandle, ClipId};
use crate::command::SourceId;
use thiserror::Error;

/// Result type alias for sonolink-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building registries or replicating commands.
///
/// Only [`Error::ClipCollision`] is fatal. Everything else is scoped to a
/// single command or call and is logged and dropped by the dispatch loop.
#[derive(Debug, Error)]
pub enum Error {
    /// Two catalog names derive the same clip id.
    #[error("Clip names '{first}' and '{second}' both hash to clip id {id}")]
    ClipCollision {
        first: String,
        second: String,
        id: ClipId,
    },

    /// A command referenced a clip id that is not in the local catalog.
    #[error("Unknown clip id {0}")]
    UnknownClip(ClipId),

    /// A local call referenced a clip handle that was never registered.
    #[error("Clip handle {0} is not registered")]
    ClipNotRegistered(ClipHandle),

    /// A wire message could not be decoded.
    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    /// The target source is not present in the source registry.
    #[error("Unknown source {0}")]
    UnknownSource(SourceId),

    /// A source with this id is already registered.
    #[error("Source {0} is already registered")]
    DuplicateSource(SourceId),

    /// A random clip loop is already running for this source.
    #[error("Random clip loop already running for source {0}")]
    RandomLoopActive(SourceId),

    /// A random clip loop was started without any clips.
    #[error("Random clip loop needs at least one clip")]
    EmptyClipSet,

    /// A random clip loop interval is negative or inverted.
    #[error("Invalid loop interval [{min}, {max}]")]
    InvalidInterval { min: f32, max: f32 },

    /// The transport failed to deliver a message.
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error while encoding a message.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
