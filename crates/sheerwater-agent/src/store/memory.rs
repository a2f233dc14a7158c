//! In-process transcript store

use parking_lot::RwLock;
use sheerwater_ai::Message;
use std::collections::HashMap;

use super::{ConversationInfo, TranscriptStore, check_order};
use crate::error::StoreError;

#[derive(Debug)]
struct Record {
    info: ConversationInfo,
    messages: Vec<Message>,
}

/// Transcript store held in memory; contents are lost on exit
#[derive(Debug, Default)]
pub struct MemoryStore {
    conversations: RwLock<HashMap<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TranscriptStore for MemoryStore {
    fn create(&self, user_id: &str) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp_millis();
        let info = ConversationInfo {
            id: id.clone(),
            user_id: user_id.to_string(),
            title: None,
            created_at: now,
            updated_at: now,
            message_count: 0,
        };
        self.conversations.write().insert(
            id.clone(),
            Record {
                info,
                messages: Vec::new(),
            },
        );
        Ok(id)
    }

    fn load(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        self.conversations
            .read()
            .get(conversation_id)
            .map(|r| r.messages.clone())
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))
    }

    fn append(&self, conversation_id: &str, message: &Message) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write();
        let record = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;

        check_order(
            conversation_id,
            record.messages.last().map(Message::timestamp),
            message,
        )?;
        record.messages.push(message.clone());
        record.info.message_count = record.messages.len();
        record.info.updated_at = record.info.updated_at.max(message.timestamp());
        Ok(())
    }

    fn get_conversation(&self, conversation_id: &str) -> Result<Option<ConversationInfo>, StoreError> {
        Ok(self
            .conversations
            .read()
            .get(conversation_id)
            .map(|r| r.info.clone()))
    }

    fn list_conversations(&self, user_id: &str, limit: usize) -> Result<Vec<ConversationInfo>, StoreError> {
        let mut infos: Vec<ConversationInfo> = self
            .conversations
            .read()
            .values()
            .filter(|r| r.info.user_id == user_id)
            .map(|r| r.info.clone())
            .collect();
        infos.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        infos.truncate(limit);
        Ok(infos)
    }

    fn set_title(&self, conversation_id: &str, title: &str) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write();
        let record = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;
        record.info.title = Some(title.to_string());
        Ok(())
    }

    fn delete(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.conversations
            .write()
            .remove(conversation_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))
    }
}
