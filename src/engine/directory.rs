//! Conversation directory: the CRUD surface next to the stream.
//!
//! The stream only ever follows one conversation. Creating, listing, renaming
//! and deleting conversations goes through a [`ConversationDirectory`], whose
//! backend is up to the embedding application.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use super::error::{DirectoryError, DirectoryResult};
use super::model::{Conversation, ConversationId, ConversationSnapshot, Message};

/// Conversation CRUD backend
pub trait ConversationDirectory: Send + Sync {
    /// Create a conversation, optionally titled
    fn create_conversation(
        &self,
        title: Option<String>,
    ) -> BoxFuture<'_, DirectoryResult<Conversation>>;

    /// List conversations, most recently updated first
    fn list_conversations(&self) -> BoxFuture<'_, DirectoryResult<Vec<Conversation>>>;

    /// Fetch one conversation with its messages
    fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> BoxFuture<'_, DirectoryResult<ConversationSnapshot>>;

    /// Rename a conversation
    fn update_title(
        &self,
        id: &ConversationId,
        title: String,
    ) -> BoxFuture<'_, DirectoryResult<Conversation>>;

    /// Delete a conversation
    fn delete_conversation(&self, id: &ConversationId) -> BoxFuture<'_, DirectoryResult<()>>;
}

/// Directory kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    conversations: Mutex<HashMap<ConversationId, ConversationSnapshot>>,
}

impl InMemoryDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored conversations
    pub fn len(&self) -> usize {
        self.conversations.lock().len()
    }

    /// True when no conversation is stored
    pub fn is_empty(&self) -> bool {
        self.conversations.lock().is_empty()
    }

    /// Append a message to its conversation
    pub fn record_message(&self, message: Message) -> DirectoryResult<()> {
        let mut conversations = self.conversations.lock();
        let entry = conversations
            .get_mut(&message.conversation_id)
            .ok_or_else(|| DirectoryError::NotFound(message.conversation_id.to_string()))?;
        entry.conversation.updated_at = Utc::now();
        entry.messages.push(message);
        Ok(())
    }

    fn create(&self, title: Option<String>) -> Conversation {
        let now = Utc::now();
        let conversation = Conversation {
            id: ConversationId::new(Uuid::new_v4().to_string()),
            title: title.filter(|title| !title.trim().is_empty()),
            created_at: now,
            updated_at: now,
        };
        self.conversations.lock().insert(
            conversation.id.clone(),
            ConversationSnapshot {
                conversation: conversation.clone(),
                messages: Vec::new(),
            },
        );
        tracing::debug!(conversation = %conversation.id, "conversation created");
        conversation
    }

    fn list(&self) -> Vec<Conversation> {
        let mut conversations: Vec<_> = self
            .conversations
            .lock()
            .values()
            .map(|entry| entry.conversation.clone())
            .collect();
        conversations.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        conversations
    }

    fn get(&self, id: &ConversationId) -> DirectoryResult<ConversationSnapshot> {
        self.conversations
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))
    }

    fn rename(&self, id: &ConversationId, title: String) -> DirectoryResult<Conversation> {
        let mut conversations = self.conversations.lock();
        let conversation = &mut conversations
            .get_mut(id)
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?
            .conversation;
        conversation.title = Some(title);
        conversation.updated_at = Utc::now();
        Ok(conversation.clone())
    }

    fn remove(&self, id: &ConversationId) -> DirectoryResult<()> {
        match self.conversations.lock().remove(id) {
            Some(_) => {
                tracing::debug!(conversation = %id, "conversation deleted");
                Ok(())
            }
            None => Err(DirectoryError::NotFound(id.to_string())),
        }
    }
}

impl ConversationDirectory for InMemoryDirectory {
    fn create_conversation(
        &self,
        title: Option<String>,
    ) -> BoxFuture<'_, DirectoryResult<Conversation>> {
        let conversation = self.create(title);
        async move { Ok(conversation) }.boxed()
    }

    fn list_conversations(&self) -> BoxFuture<'_, DirectoryResult<Vec<Conversation>>> {
        let conversations = self.list();
        async move { Ok(conversations) }.boxed()
    }

    fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> BoxFuture<'_, DirectoryResult<ConversationSnapshot>> {
        let result = self.get(id);
        async move { result }.boxed()
    }

    fn update_title(
        &self,
        id: &ConversationId,
        title: String,
    ) -> BoxFuture<'_, DirectoryResult<Conversation>> {
        let result = self.rename(id, title);
        async move { result }.boxed()
    }

    fn delete_conversation(&self, id: &ConversationId) -> BoxFuture<'_, DirectoryResult<()>> {
        let result = self.remove(id);
        async move { result }.boxed()
    }
}
