//! JSONL transcript store: one append-only file per conversation

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sheerwater_ai::Message;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{ConversationInfo, TranscriptStore, check_order};
use crate::error::StoreError;

/// Line types in a conversation file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Entry {
    /// Always the first line
    Metadata {
        id: String,
        user_id: String,
        created_at: i64,
    },
    /// A message in the conversation
    Message { message: Message },
    /// Title change; the last one wins
    Title { title: String },
}

/// Transcript store writing `<dir>/<conversation_id>.jsonl`
pub struct JsonlStore {
    dir: PathBuf,
    /// Last message timestamp per conversation, filled lazily
    last_timestamps: Mutex<HashMap<String, Option<i64>>>,
}

impl JsonlStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            last_timestamps: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, conversation_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !conversation_id.is_empty()
            && conversation_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::NotFound(conversation_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.jsonl", conversation_id)))
    }

    fn existing_path(&self, conversation_id: &str) -> Result<PathBuf, StoreError> {
        let path = self.path(conversation_id)?;
        if !path.exists() {
            return Err(StoreError::NotFound(conversation_id.to_string()));
        }
        Ok(path)
    }

    fn write_entry(path: &Path, entry: &Entry) -> Result<(), StoreError> {
        let mut file = File::options().read(true).append(true).open(path)?;
        let torn = Self::ends_mid_line(&mut file)?;
        let mut writer = BufWriter::new(file);
        if torn {
            // Start on a fresh line after an interrupted write
            writeln!(writer)?;
        }
        writeln!(writer, "{}", serde_json::to_string(entry)?)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn ends_mid_line(file: &mut File) -> Result<bool, StoreError> {
        if file.metadata()?.len() == 0 {
            return Ok(false);
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        Ok(last[0] != b'\n')
    }

    /// Lines that fail to parse (a torn final write) are skipped
    fn read_entries(path: &Path) -> Result<Vec<Entry>, StoreError> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(
                    "Skipping unreadable line {} in {}: {}",
                    number + 1,
                    path.display(),
                    e
                ),
            }
        }
        Ok(entries)
    }

    fn read_info(path: &Path) -> Result<Option<ConversationInfo>, StoreError> {
        let mut info: Option<ConversationInfo> = None;
        for entry in Self::read_entries(path)? {
            match entry {
                Entry::Metadata {
                    id,
                    user_id,
                    created_at,
                } => {
                    if info.is_none() {
                        info = Some(ConversationInfo {
                            id,
                            user_id,
                            title: None,
                            created_at,
                            updated_at: created_at,
                            message_count: 0,
                        });
                    }
                }
                Entry::Message { message } => {
                    if let Some(info) = info.as_mut() {
                        info.message_count += 1;
                        info.updated_at = info.updated_at.max(message.timestamp());
                    }
                }
                Entry::Title { title } => {
                    if let Some(info) = info.as_mut() {
                        info.title = Some(title);
                    }
                }
            }
        }
        Ok(info)
    }

    fn last_timestamp(&self, conversation_id: &str, path: &Path) -> Result<Option<i64>, StoreError> {
        if let Some(last) = self.last_timestamps.lock().get(conversation_id) {
            return Ok(*last);
        }
        let last = Self::read_entries(path)?
            .into_iter()
            .filter_map(|e| match e {
                Entry::Message { message } => Some(message.timestamp()),
                _ => None,
            })
            .last();
        self.last_timestamps
            .lock()
            .insert(conversation_id.to_string(), last);
        Ok(last)
    }
}

impl TranscriptStore for JsonlStore {
    fn create(&self, user_id: &str) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let path = self.path(&id)?;

        let file = File::options().write(true).create_new(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        let metadata = Entry::Metadata {
            id: id.clone(),
            user_id: user_id.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        writeln!(writer, "{}", serde_json::to_string(&metadata)?)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;

        self.last_timestamps.lock().insert(id.clone(), None);
        tracing::debug!("Created conversation {} at {}", id, path.display());
        Ok(id)
    }

    fn load(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let path = self.existing_path(conversation_id)?;
        Ok(Self::read_entries(&path)?
            .into_iter()
            .filter_map(|e| match e {
                Entry::Message { message } => Some(message),
                _ => None,
            })
            .collect())
    }

    fn append(&self, conversation_id: &str, message: &Message) -> Result<(), StoreError> {
        let path = self.existing_path(conversation_id)?;
        let last = self.last_timestamp(conversation_id, &path)?;
        check_order(conversation_id, last, message)?;

        Self::write_entry(
            &path,
            &Entry::Message {
                message: message.clone(),
            },
        )?;
        self.last_timestamps
            .lock()
            .insert(conversation_id.to_string(), Some(message.timestamp()));
        Ok(())
    }

    fn get_conversation(&self, conversation_id: &str) -> Result<Option<ConversationInfo>, StoreError> {
        let path = match self.path(conversation_id) {
            Ok(path) => path,
            Err(_) => return Ok(None),
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::read_info(&path)
    }

    fn list_conversations(&self, user_id: &str, limit: usize) -> Result<Vec<ConversationInfo>, StoreError> {
        let mut conversations = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                continue;
            }
            match Self::read_info(&path) {
                Ok(Some(info)) if info.user_id == user_id => conversations.push(info),
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping unreadable transcript {}: {}", path.display(), e),
            }
        }

        // Most recently updated first
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        conversations.truncate(limit);
        Ok(conversations)
    }

    fn set_title(&self, conversation_id: &str, title: &str) -> Result<(), StoreError> {
        let path = self.existing_path(conversation_id)?;
        Self::write_entry(
            &path,
            &Entry::Title {
                title: title.to_string(),
            },
        )
    }

    fn delete(&self, conversation_id: &str) -> Result<(), StoreError> {
        let path = self.existing_path(conversation_id)?;
        fs::remove_file(path)?;
        self.last_timestamps.lock().remove(conversation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sheerwater_ai::{ToolOutcome, ToolRequest, ToolResultContent};

    fn temp_store() -> (tempfile::TempDir, JsonlStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path().join("conversations")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_round_trip_through_disk() {
        let (dir, store) = temp_store();
        let id = store.create("alice").unwrap();

        let call = ToolRequest::new("toolu_1", "lookup", json!({"q": "x"}))
            .complete(ToolOutcome::Success { result: json!({"value": "42"}) });
        let messages = vec![
            Message::user("question").with_timestamp(100),
            Message::assistant("", vec![call]).with_timestamp(101),
            Message::tool_results(vec![ToolResultContent {
                tool_call_id: "toolu_1".into(),
                content: "{\"value\":\"42\"}".into(),
                is_error: false,
            }])
            .with_timestamp(102),
            Message::assistant("The answer is 42", vec![]).with_timestamp(103),
        ];
        for message in &messages {
            store.append(&id, message).unwrap();
        }

        // A fresh store over the same directory sees the same transcript
        let reopened = JsonlStore::open(dir.path().join("conversations")).unwrap();
        assert_eq!(reopened.load(&id).unwrap(), messages);
        assert_eq!(reopened.load(&id).unwrap(), reopened.load(&id).unwrap());

        let err = reopened
            .append(&id, &Message::user("stale").with_timestamp(50))
            .unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder { last: 103, .. }));
    }

    #[test]
    fn test_info_title_and_listing() {
        let (_dir, store) = temp_store();
        let first = store.create("alice").unwrap();
        let second = store.create("alice").unwrap();
        let other = store.create("bob").unwrap();

        let later = chrono::Utc::now().timestamp_millis() + 60_000;
        store.append(&first, &Message::user("hi").with_timestamp(later)).unwrap();
        store.set_title(&first, "Old title").unwrap();
        store.set_title(&first, "New title").unwrap();

        let info = store.get_conversation(&first).unwrap().unwrap();
        assert_eq!(info.user_id, "alice");
        assert_eq!(info.title.as_deref(), Some("New title"));
        assert_eq!(info.message_count, 1);
        assert_eq!(info.updated_at, later);

        let listed = store.list_conversations("alice", 50).unwrap();
        let ids: Vec<_> = listed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![first.as_str(), second.as_str()]);
        assert!(!ids.contains(&other.as_str()));
    }

    #[test]
    fn test_delete_and_missing() {
        let (_dir, store) = temp_store();
        let id = store.create("alice").unwrap();
        store.delete(&id).unwrap();

        assert!(store.get_conversation(&id).unwrap().is_none());
        assert!(matches!(store.load(&id), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(&id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_torn_trailing_line_keeps_prior_messages() {
        let (_dir, store) = temp_store();
        let id = store.create("alice").unwrap();
        let messages = vec![
            Message::user("question").with_timestamp(100),
            Message::assistant("answer", vec![]).with_timestamp(101),
        ];
        for message in &messages {
            store.append(&id, message).unwrap();
        }

        // Crash halfway through the next append
        let path = store.path(&id).unwrap();
        let mut file = File::options().append(true).open(&path).unwrap();
        write!(file, "{{\"type\":\"message\",\"message\":{{\"role\":\"user\",\"con").unwrap();
        drop(file);

        let reopened = JsonlStore::open(store.dir()).unwrap();
        assert_eq!(reopened.load(&id).unwrap(), messages);
        assert_eq!(reopened.get_conversation(&id).unwrap().unwrap().message_count, 2);
        assert_eq!(reopened.list_conversations("alice", 50).unwrap().len(), 1);

        // The next append lands on its own line
        let next = Message::user("follow-up").with_timestamp(102);
        reopened.append(&id, &next).unwrap();
        let mut expected = messages.clone();
        expected.push(next);
        assert_eq!(reopened.load(&id).unwrap(), expected);
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let (_dir, store) = temp_store();
        assert!(matches!(store.load("../etc/passwd"), Err(StoreError::NotFound(_))));
        assert!(store.get_conversation("a/b").unwrap().is_none());
    }
}
