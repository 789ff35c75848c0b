use std::sync::{Mutex, MutexGuard};

use super::{TranscriptError, TranscriptStore};
use crate::conversation::Conversation;

/// Keeps the conversation in memory, for tests and embedders that do not
/// need files.
#[derive(Debug, Default)]
pub struct MemoryTranscriptStore {
    saved: Mutex<Conversation>,
}

impl MemoryTranscriptStore {
    /// Creates an empty store.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds `conversation`.
    #[inline]
    pub fn with_conversation(conversation: Conversation) -> Self {
        Self {
            saved: Mutex::new(conversation),
        }
    }

    fn saved(&self) -> MutexGuard<'_, Conversation> {
        self.saved.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl TranscriptStore for MemoryTranscriptStore {
    fn load(&self) -> Result<Conversation, TranscriptError> {
        Ok(self.saved().clone())
    }

    fn save(&self, conversation: &Conversation) -> Result<(), TranscriptError> {
        *self.saved() = conversation.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Turn;

    #[test]
    fn test_round_trip() {
        let store = MemoryTranscriptStore::new();
        assert!(store.load().unwrap().is_empty());

        let conversation =
            Conversation::from_turns([Turn::user("hi"), Turn::assistant("hello")])
                .unwrap();
        store.save(&conversation).unwrap();
        assert_eq!(store.load().unwrap(), conversation);

        store.save(&Conversation::new()).unwrap();
        assert!(store.load().unwrap().is_empty());
    }
}
