use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::format::{parse_transcript, render_transcript};
use super::{TranscriptError, TranscriptStore};
use crate::conversation::Conversation;

/// Stores a conversation in a text file.
///
/// Saving writes a temporary file next to the target and renames it over
/// the target, so a reader sees either the old or the new transcript.
#[derive(Clone, Debug)]
pub struct FileTranscriptStore {
    path: PathBuf,
}

impl FileTranscriptStore {
    /// Creates a store backed by the file at `path`.
    #[inline]
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path of the transcript file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TranscriptStore for FileTranscriptStore {
    fn load(&self) -> Result<Conversation, TranscriptError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("no transcript at {}", self.path.display());
                return Ok(Conversation::new());
            }
            Err(err) => return Err(err.into()),
        };
        let conversation = parse_transcript(&text);
        debug!(
            "loaded {} turn(s) from {}",
            conversation.len(),
            self.path.display()
        );
        Ok(conversation)
    }

    fn save(&self, conversation: &Conversation) -> Result<(), TranscriptError> {
        let text = render_transcript(conversation)?;
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(text.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|err| err.error)?;
        debug!(
            "saved {} turn(s) to {}",
            conversation.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::conversation::{ToolCall, ToolOutcome, Turn};

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path().join("history.txt"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_empty_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path().join("history.txt"));
        store.save(&Conversation::new()).unwrap();
        assert!(store.path().exists());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path().join("history.txt"));
        let conversation = Conversation::from_turns([
            Turn::user("hi"),
            Turn::assistant("hello"),
        ])
        .unwrap();
        store.save(&conversation).unwrap();
        assert_eq!(store.load().unwrap(), conversation);
    }

    #[test]
    fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTranscriptStore::new(dir.path().join("history.txt"));
        let long = Conversation::from_turns([
            Turn::user("add"),
            Turn::Assistant {
                text: String::new(),
                tool_calls: vec![ToolCall {
                    id: "c1".to_owned(),
                    tool_name: "add".to_owned(),
                    arguments: json!({ "a": 1, "b": 1 }),
                }],
            },
            Turn::ToolResult {
                call_id: "c1".to_owned(),
                tool_name: "add".to_owned(),
                outcome: ToolOutcome::Success("2".to_owned()),
            },
        ])
        .unwrap();
        store.save(&long).unwrap();
        assert_eq!(store.load().unwrap(), long);

        let short = Conversation::from_turns([Turn::user("again")]).unwrap();
        store.save(&short).unwrap();
        assert_eq!(store.load().unwrap(), short);

        // Only the transcript itself is left behind.
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
