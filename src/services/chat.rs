use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::read_tracker::ReadTracker;
use crate::backend::types::{ChangeEvent, ChangeFilter, ChangeKind, ConversationLookup, Subscription, CONVERSATIONS, MESSAGES};
use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::local_store::LocalStore;
use crate::models::{location_url, Conversation, Message, NewConversation, NewMessage, Profile, ServiceRequest};

/// A conversation row plus the caller's unread flag
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub unread: bool,
}

const REFRESH_CAPACITY: usize = 8;

/// Conversation management for the signed-in user
#[derive(Clone)]
pub struct ChatService {
    backend: Arc<dyn Backend>,
    user_id: String,
    tracker: ReadTracker,
}

impl ChatService {
    pub fn new(backend: Arc<dyn Backend>, store: LocalStore, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            tracker: ReadTracker::new(store, user_id.clone()),
            backend,
            user_id,
        }
    }

    pub fn tracker(&self) -> &ReadTracker {
        &self.tracker
    }

    /// Reuse or create the conversation about a listing
    pub async fn contact_listing(&self, request: &ServiceRequest) -> Result<Conversation> {
        if request.requester_id == self.user_id {
            return Err(Error::Validation("You cannot message yourself".to_string()));
        }

        let lookup = ConversationLookup::ForRequest {
            request_id: request.id.clone(),
            donor_id: self.user_id.clone(),
        };
        if let Some(existing) = self.backend.find_conversation(&lookup).await? {
            return Ok(existing);
        }

        let created = self
            .backend
            .insert_conversation(&NewConversation {
                request_id: Some(request.id.clone()),
                donor_id: self.user_id.clone(),
                requester_id: request.requester_id.clone(),
                last_message_at: Utc::now(),
            })
            .await?;
        info!("Started conversation {} about listing {}", created.id, request.id);
        Ok(created)
    }

    /// Reuse or create a direct conversation with another user
    pub async fn contact_user(&self, other_id: &str) -> Result<Conversation> {
        if other_id == self.user_id {
            return Err(Error::Validation("You cannot message yourself".to_string()));
        }

        let lookup = ConversationLookup::BetweenUsers {
            first: self.user_id.clone(),
            second: other_id.to_string(),
        };
        if let Some(existing) = self.backend.find_conversation(&lookup).await? {
            return Ok(existing);
        }

        let created = self
            .backend
            .insert_conversation(&NewConversation {
                request_id: None,
                donor_id: self.user_id.clone(),
                requester_id: other_id.to_string(),
                last_message_at: Utc::now(),
            })
            .await?;
        info!("Started direct conversation {} with {}", created.id, other_id);
        Ok(created)
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>> {
        let conversations = self.backend.list_conversations(&self.user_id).await?;
        Ok(conversations
            .into_iter()
            .map(|conversation| ConversationSummary {
                unread: self.tracker.is_unread(&conversation),
                conversation,
            })
            .collect())
    }

    pub async fn unread_count(&self) -> Result<usize> {
        let conversations = self.backend.list_conversations(&self.user_id).await?;
        Ok(self.tracker.unread_count(&conversations))
    }

    /// Load a conversation with its messages and mark it read
    pub async fn open(&self, conversation_id: &str) -> Result<ChatRoom> {
        let conversation = self
            .backend
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id)))?;
        let messages = self.backend.list_messages(conversation_id).await?;

        if let Err(err) = self.tracker.mark_read(conversation_id) {
            warn!("Could not store read status for {}: {}", conversation_id, err);
        }

        Ok(ChatRoom {
            backend: Arc::clone(&self.backend),
            user_id: self.user_id.clone(),
            conversation,
            messages,
            draft: String::new(),
            temp_seq: 0,
        })
    }

    /// Delete every message of the conversation, then the conversation itself
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        self.backend.delete_messages_in(conversation_id).await?;
        self.backend.delete_conversation(conversation_id).await?;
        if let Err(err) = self.tracker.forget(conversation_id) {
            warn!("Could not clear read status for {}: {}", conversation_id, err);
        }
        info!("Deleted conversation {}", conversation_id);
        Ok(())
    }

    /// Changes that invalidate the conversation list
    pub fn list_subscription(&self) -> Subscription {
        Subscription::new("chats_realtime")
            .on(ChangeFilter::new(ChangeKind::All, CONVERSATIONS))
            .on(ChangeFilter::new(ChangeKind::Insert, MESSAGES))
    }

    pub async fn watch_list(&self) -> Result<mpsc::Receiver<ChangeEvent>> {
        self.backend.subscribe(&self.list_subscription()).await
    }

    /// Re-fetch the conversation list, unread flags included, after every change.
    ///
    /// Changes already queued when a refresh starts are folded into it.
    pub async fn follow_conversations(&self) -> Result<mpsc::Receiver<Result<Vec<ConversationSummary>>>> {
        let mut events = self.watch_list().await?;
        let (tx, rx) = mpsc::channel(REFRESH_CAPACITY);
        let service = self.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let mut skipped = 0;
                while events.try_recv().is_ok() {
                    skipped += 1;
                }
                debug!("{:?} on {} (+{} queued); refreshing chats", event.kind, event.table, skipped);
                let refreshed = service.conversations().await;
                if let Err(err) = &refreshed {
                    warn!("Chat list refresh failed: {}", err);
                }
                if tx.send(refreshed).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

/// Open conversation with its message list.
///
/// Sends are optimistic: a temporary entry is shown immediately and replaced by
/// the stored row, or removed if the insert fails.
pub struct ChatRoom {
    backend: Arc<dyn Backend>,
    user_id: String,
    conversation: Conversation,
    messages: Vec<Message>,
    draft: String,
    temp_seq: u64,
}

impl ChatRoom {
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn other_profile(&self) -> Option<&Profile> {
        self.conversation.other_profile(&self.user_id)
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    /// Take the draft and show it as a temporary message; `None` for a blank draft
    pub fn begin_send(&mut self) -> Option<Message> {
        self.begin_send_at(Utc::now())
    }

    fn begin_send_at(&mut self, now: DateTime<Utc>) -> Option<Message> {
        let text = self.draft.trim().to_string();
        if text.is_empty() {
            return None;
        }
        self.draft.clear();

        let mut temp = Message::temporary(&self.conversation.id, &self.user_id, &text, now);
        let base = temp.id.clone();
        while self.messages.iter().any(|m| m.id == temp.id) {
            self.temp_seq += 1;
            temp.id = format!("{}-{}", base, self.temp_seq);
        }
        self.messages.push(temp.clone());
        Some(temp)
    }

    /// Swap the temporary entry for the stored row
    pub fn confirm_sent(&mut self, temp_id: &str, row: Message) {
        if self.messages.iter().any(|m| m.id == row.id) {
            // realtime delivered the row first
            self.messages.retain(|m| m.id != temp_id);
        } else if let Some(slot) = self.messages.iter_mut().find(|m| m.id == temp_id) {
            *slot = row;
        } else {
            self.messages.push(row);
        }
    }

    pub fn rollback_send(&mut self, temp_id: &str) {
        self.messages.retain(|m| m.id != temp_id);
    }

    pub async fn send(&mut self, text: &str) -> Result<Option<Message>> {
        self.set_draft(text);
        self.send_draft().await
    }

    pub async fn send_draft(&mut self) -> Result<Option<Message>> {
        let Some(temp) = self.begin_send() else {
            return Ok(None);
        };

        let new = NewMessage {
            conversation_id: self.conversation.id.clone(),
            sender_id: self.user_id.clone(),
            text: temp.text.clone().unwrap_or_default(),
        };
        match self.backend.insert_message(&new).await {
            Ok(row) => {
                self.confirm_sent(&temp.id, row.clone());
                let now = Utc::now();
                self.conversation.last_message_at = now;
                if let Err(err) = self.backend.touch_conversation(&self.conversation.id, now).await {
                    warn!("Could not bump activity of {}: {}", self.conversation.id, err);
                }
                Ok(Some(row))
            }
            Err(err) => {
                self.rollback_send(&temp.id);
                if err.is_permission_denied() {
                    error!("Send failed: RLS Policy issue ({})", err);
                } else {
                    error!("Send error: {}", err);
                }
                Err(err)
            }
        }
    }

    pub async fn share_location(&mut self, latitude: f64, longitude: f64) -> Result<Option<Message>> {
        self.send(&location_url(latitude, longitude)).await
    }

    /// Delete one of the user's own confirmed messages
    pub async fn delete_message(&mut self, message_id: &str) -> Result<()> {
        let message = self
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .ok_or_else(|| Error::NotFound(format!("message {}", message_id)))?;
        if message.is_temporary() {
            return Err(Error::Validation("message is still being sent".to_string()));
        }
        if message.sender_id != self.user_id {
            return Err(Error::Validation("You can only delete your own messages".to_string()));
        }

        self.backend.delete_message(message_id).await?;
        self.messages.retain(|m| m.id != message_id);
        Ok(())
    }

    /// Apply a realtime change; returns whether the message list changed
    pub fn apply(&mut self, event: &ChangeEvent) -> bool {
        if event.table != MESSAGES {
            return false;
        }
        match event.kind {
            ChangeKind::Insert => {
                let Some(message) = event.decode_record::<Message>() else {
                    return false;
                };
                if message.conversation_id != self.conversation.id || self.messages.iter().any(|m| m.id == message.id) {
                    return false;
                }
                self.messages.push(message);
                true
            }
            ChangeKind::Delete => {
                let Some(id) = event.old_id() else {
                    return false;
                };
                let before = self.messages.len();
                self.messages.retain(|m| m.id != id);
                self.messages.len() != before
            }
            _ => false,
        }
    }

    pub fn subscription(&self) -> Subscription {
        Subscription::new(format!("chat_room_{}", self.conversation.id))
            .on(ChangeFilter::new(ChangeKind::Insert, MESSAGES).eq("conversation_id", &self.conversation.id))
            .on(ChangeFilter::new(ChangeKind::Delete, MESSAGES))
    }

    pub async fn watch(&self) -> Result<mpsc::Receiver<ChangeEvent>> {
        self.backend.subscribe(&self.subscription()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::{json, Value};

    async fn room() -> (Arc<MemoryBackend>, ChatRoom) {
        let backend = Arc::new(MemoryBackend::new());
        let service = ChatService::new(backend.clone(), LocalStore::in_memory(), "alice");
        let conv = service.contact_user("bob").await.unwrap();
        let room = service.open(&conv.id).await.unwrap();
        (backend, room)
    }

    #[tokio::test]
    async fn test_blank_draft_is_not_sent() {
        let (_, mut room) = room().await;
        assert!(room.send("   ").await.unwrap().is_none());
        assert!(room.messages().is_empty());
    }

    #[tokio::test]
    async fn test_begin_send_shows_one_temporary_entry() {
        let (_, mut room) = room().await;
        room.set_draft("hello");
        let temp = room.begin_send().unwrap();

        assert_eq!(room.messages().len(), 1);
        assert!(room.messages()[0].is_temporary());
        assert_eq!(room.messages()[0].id, temp.id);
        assert_eq!(room.draft(), "");
    }

    #[tokio::test]
    async fn test_confirm_after_realtime_does_not_duplicate() {
        let (_, mut room) = room().await;
        room.set_draft("hello");
        let temp = room.begin_send().unwrap();

        let stored = Message {
            id: "m1".to_string(),
            ..temp.clone()
        };
        let event = ChangeEvent::new(MESSAGES, ChangeKind::Insert, serde_json::to_value(&stored).unwrap(), Value::Null);
        assert!(room.apply(&event));

        room.confirm_sent(&temp.id, stored);
        assert_eq!(room.messages().len(), 1);
        assert_eq!(room.messages()[0].id, "m1");
    }

    #[tokio::test]
    async fn test_apply_ignores_other_conversations_and_known_ids() {
        let (_, mut room) = room().await;
        let record = json!({
            "id": "m1", "conversation_id": "elsewhere", "sender_id": "bob",
            "text": "hi", "created_at": "2025-03-01T10:00:00Z"
        });
        let event = ChangeEvent::new(MESSAGES, ChangeKind::Insert, record, Value::Null);
        assert!(!room.apply(&event));

        let delete = ChangeEvent::new(MESSAGES, ChangeKind::Delete, Value::Null, json!({"id": "missing"}));
        assert!(!room.apply(&delete));
    }

    #[tokio::test]
    async fn test_same_millisecond_sends_get_distinct_ids_after_delete() {
        let (_, mut room) = room().await;
        let conv_id = room.conversation().id.clone();
        let now = Utc::now();
        let record = json!({
            "id": "m1", "conversation_id": conv_id, "sender_id": "bob",
            "text": "hi", "created_at": "2025-03-01T10:00:00Z"
        });
        room.apply(&ChangeEvent::new(MESSAGES, ChangeKind::Insert, record, Value::Null));

        room.set_draft("one");
        let first = room.begin_send_at(now).unwrap();
        room.set_draft("two");
        let second = room.begin_send_at(now).unwrap();

        let delete = ChangeEvent::new(MESSAGES, ChangeKind::Delete, Value::Null, json!({"id": "m1"}));
        assert!(room.apply(&delete));

        room.set_draft("three");
        let third = room.begin_send_at(now).unwrap();

        assert_ne!(first.id, second.id);
        assert_ne!(second.id, third.id);
        assert_ne!(first.id, third.id);
        assert_eq!(room.messages().len(), 3);
    }

    #[tokio::test]
    async fn test_follow_conversations_refetches_with_unread_flags() {
        let backend = Arc::new(MemoryBackend::new());
        let alice = ChatService::new(backend.clone(), LocalStore::in_memory(), "alice");
        let bob = ChatService::new(backend.clone(), LocalStore::in_memory(), "bob");
        let conv = alice.contact_user("bob").await.unwrap();

        bob.open(&conv.id).await.unwrap();
        assert!(!bob.conversations().await.unwrap()[0].unread);
        let mut updates = bob.follow_conversations().await.unwrap();

        let mut room = alice.open(&conv.id).await.unwrap();
        room.send("are you free tomorrow?").await.unwrap();

        let refreshed = updates.recv().await.unwrap().unwrap();
        assert_eq!(refreshed.len(), 1);
        assert_eq!(refreshed[0].conversation.id, conv.id);
        assert!(refreshed[0].unread);

        // a second conversation arriving also triggers a refresh
        let carol = ChatService::new(backend.clone(), LocalStore::in_memory(), "carol");
        carol.contact_user("bob").await.unwrap();
        let refreshed = updates.recv().await.unwrap().unwrap();
        assert_eq!(refreshed.len(), 2);
    }

    #[tokio::test]
    async fn test_cannot_delete_someone_elses_message() {
        let (backend, mut room) = room().await;
        let conv_id = room.conversation().id.clone();
        let theirs = backend
            .insert_message(&NewMessage {
                conversation_id: conv_id.clone(),
                sender_id: "bob".to_string(),
                text: "hi alice".to_string(),
            })
            .await
            .unwrap();
        let event = ChangeEvent::new(MESSAGES, ChangeKind::Insert, serde_json::to_value(&theirs).unwrap(), Value::Null);
        room.apply(&event);

        let err = room.delete_message(&theirs.id).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(room.messages().len(), 1);
    }
}
