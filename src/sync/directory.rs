//! Conversation directory: the observed, locally cached conversation list
//! with display-name resolution and client-side search. The heavy lifting
//! (remote stream → local store) belongs to the conversation reconciler;
//! this layer only reads the store and the profile collaborator.

use std::sync::Arc;

use crate::error::SyncError;
use crate::models::Conversation;
use crate::remote::ProfileDirectory;
use crate::storage::LocalStore;

pub struct ConversationDirectory {
    store: Arc<LocalStore>,
    profiles: Arc<dyn ProfileDirectory>,
    user_id: String,
}

impl ConversationDirectory {
    pub fn new(
        store: Arc<LocalStore>,
        profiles: Arc<dyn ProfileDirectory>,
        user_id: &str,
    ) -> Self {
        ConversationDirectory {
            store,
            profiles,
            user_id: user_id.to_string(),
        }
    }

    /// All of the user's conversations, most recent activity first. Served
    /// from the local cache, so it works offline.
    pub async fn conversations(&self) -> Result<Vec<Conversation>, SyncError> {
        self.store.get_conversations(&self.user_id).await
    }

    /// What a conversation row is called: the group's name, or the other
    /// participant's display name, falling back to their raw id.
    pub async fn display_title(&self, conversation: &Conversation) -> String {
        if let Some(name) = &conversation.group_name {
            if !name.is_empty() {
                return name.clone();
            }
        }
        match conversation.other_participant(&self.user_id) {
            Some(other) => self
                .profiles
                .display_name(other)
                .await
                .unwrap_or_else(|| other.to_string()),
            None => conversation.id.clone(),
        }
    }

    /// Case-insensitive substring search over resolved titles. An empty
    /// query returns everything.
    pub async fn search(&self, query: &str) -> Result<Vec<Conversation>, SyncError> {
        let all = self.conversations().await?;
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(all);
        }
        let mut matches = Vec::new();
        for conversation in all {
            let title = self.display_title(&conversation).await;
            if title.to_lowercase().contains(&needle) {
                matches.push(conversation);
            }
        }
        Ok(matches)
    }

    /// The user's unread count for one conversation, 0 if unknown.
    pub async fn unread_count(&self, conversation_id: &str) -> Result<u32, SyncError> {
        Ok(self
            .store
            .get_conversation(conversation_id)
            .await?
            .map(|c| c.unread_for(&self.user_id))
            .unwrap_or(0))
    }
}
