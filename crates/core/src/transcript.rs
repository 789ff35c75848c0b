//! Persistence of conversations between process runs.

mod file;
mod format;
mod memory;

use std::sync::Arc;

use crate::conversation::Conversation;
pub use file::FileTranscriptStore;
pub use format::{parse_transcript, render_transcript};
pub use memory::MemoryTranscriptStore;

/// Errors from loading or saving a transcript.
#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    /// Reading or writing the record failed.
    #[error("transcript I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// A turn could not be encoded.
    #[error("failed to encode a turn: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A place where a conversation is kept between runs.
pub trait TranscriptStore: Send + Sync {
    /// Loads the stored conversation, or an empty one if nothing was saved
    /// yet.
    fn load(&self) -> Result<Conversation, TranscriptError>;

    /// Replaces the stored conversation.
    fn save(&self, conversation: &Conversation) -> Result<(), TranscriptError>;
}

impl<S: TranscriptStore + ?Sized> TranscriptStore for Arc<S> {
    #[inline]
    fn load(&self) -> Result<Conversation, TranscriptError> {
        (**self).load()
    }

    #[inline]
    fn save(&self, conversation: &Conversation) -> Result<(), TranscriptError> {
        (**self).save(conversation)
    }
}
