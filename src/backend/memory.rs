use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::traits::Backend;
use super::types::{
    ChangeEvent, ChangeKind, ConversationLookup, ProfileQuery, RequestQuery, Subscription, CONVERSATIONS, MESSAGES,
    PROFILES, REQUESTS, REVIEWS,
};
use crate::error::{Error, Result, PERMISSION_DENIED_CODE};
use crate::models::{
    Conversation, Message, NewConversation, NewMessage, NewReview, NewServiceRequest, Profile, ProfileUpdate,
    RequestStatus, ServiceRequest,
};
use crate::services::rating::aggregate;

const CHANNEL_CAPACITY: usize = 64;

/// In-process backend holding every table in memory.
///
/// Writes emit change events to matching subscriptions, like the hosted
/// realtime service does.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    profiles: Vec<Profile>,
    requests: Vec<ServiceRequest>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    reviews: Vec<NewReview>,
    objects: BTreeMap<String, Vec<u8>>,
    denied_writes: HashSet<String>,
    missing_tables: HashSet<String>,
    subscribers: Vec<(Subscription, mpsc::Sender<ChangeEvent>)>,
}

fn to_value<T: Serialize>(row: &T) -> Value {
    serde_json::to_value(row).unwrap_or(Value::Null)
}

impl State {
    fn check_read(&self, table: &str) -> Result<()> {
        if self.missing_tables.contains(table) {
            return Err(Error::api(
                404,
                Some("42P01".to_string()),
                format!("relation \"public.{}\" does not exist", table),
            ));
        }
        Ok(())
    }

    fn check_write(&self, table: &str) -> Result<()> {
        self.check_read(table)?;
        if self.denied_writes.contains(table) {
            return Err(Error::api(
                403,
                Some(PERMISSION_DENIED_CODE.to_string()),
                format!("new row violates row-level security policy for table \"{}\"", table),
            ));
        }
        Ok(())
    }

    fn profile(&self, id: &str) -> Option<Profile> {
        self.profiles.iter().find(|p| p.id == id).cloned()
    }

    fn with_owner(&self, request: &ServiceRequest) -> ServiceRequest {
        let mut request = request.clone();
        request.owner = self.profile(&request.requester_id);
        request
    }

    fn with_participants(&self, conversation: &Conversation) -> Conversation {
        let mut conversation = conversation.clone();
        conversation.donor_profile = self.profile(&conversation.donor_id);
        conversation.requester_profile = self.profile(&conversation.requester_id);
        conversation
    }

    fn emit(&mut self, event: ChangeEvent) {
        self.subscribers.retain(|(_, tx)| !tx.is_closed());
        for (subscription, tx) in &self.subscribers {
            if !subscription.wants(&event) {
                continue;
            }
            if let Err(e) = tx.try_send(event.clone()) {
                warn!("Dropping change event for {}: {}", subscription.channel, e);
            }
        }
    }

    fn emit_insert<T: Serialize>(&mut self, table: &str, row: &T) {
        self.emit(ChangeEvent::new(table, ChangeKind::Insert, to_value(row), Value::Null));
    }

    fn emit_update<T: Serialize>(&mut self, table: &str, row: &T) {
        self.emit(ChangeEvent::new(table, ChangeKind::Update, to_value(row), Value::Null));
    }

    fn emit_delete<T: Serialize>(&mut self, table: &str, row: &T) {
        self.emit(ChangeEvent::new(table, ChangeKind::Delete, Value::Null, to_value(row)));
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn seed_profile(&self, profile: Profile) {
        let mut state = self.state();
        state.profiles.retain(|p| p.id != profile.id);
        state.profiles.push(profile);
    }

    pub fn seed_request(&self, request: ServiceRequest) {
        self.state().requests.push(request);
    }

    /// Reject writes to `table` as a row-level security policy would
    pub fn deny_writes(&self, table: &str) {
        self.state().denied_writes.insert(table.to_string());
    }

    pub fn allow_writes(&self, table: &str) {
        self.state().denied_writes.remove(table);
    }

    /// Make every operation on `table` fail as if it did not exist
    pub fn drop_table(&self, table: &str) {
        self.state().missing_tables.insert(table.to_string());
    }

    pub fn object(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.state().objects.get(&format!("{}/{}", bucket, path)).cloned()
    }

    pub fn review_count(&self) -> usize {
        self.state().reviews.len()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_profile(&self, id: &str) -> Result<Option<Profile>> {
        let state = self.state();
        state.check_read(PROFILES)?;
        Ok(state.profile(id))
    }

    async fn search_profiles(&self, query: &ProfileQuery) -> Result<Vec<Profile>> {
        let state = self.state();
        state.check_read(PROFILES)?;

        let term = query.search.as_deref().unwrap_or("").to_lowercase();
        let mut found: Vec<Profile> = state
            .profiles
            .iter()
            .filter(|p| !query.providers_only || p.role.is_provider())
            .filter(|p| {
                term.is_empty()
                    || p.full_name.to_lowercase().contains(&term)
                    || p.username.as_deref().unwrap_or("").to_lowercase().contains(&term)
            })
            .cloned()
            .collect();
        if term.is_empty() {
            found.sort_by(|a, b| b.rating.total_cmp(&a.rating));
        }
        found.truncate(query.limit);
        Ok(found)
    }

    async fn find_profile_conflict(
        &self,
        exclude_id: &str,
        username: &str,
        full_name: &str,
    ) -> Result<Option<Profile>> {
        let state = self.state();
        state.check_read(PROFILES)?;
        Ok(state
            .profiles
            .iter()
            .find(|p| p.id != exclude_id && (p.username.as_deref() == Some(username) || p.full_name == full_name))
            .cloned())
    }

    async fn upsert_profile(&self, update: &ProfileUpdate) -> Result<Profile> {
        let mut state = self.state();
        state.check_write(PROFILES)?;

        let existing = state.profiles.iter().position(|p| p.id == update.id);
        let profile = match existing {
            Some(idx) => {
                let p = &mut state.profiles[idx];
                p.full_name = update.full_name.clone();
                p.username = Some(update.username.clone());
                p.phone = Some(update.phone.clone());
                p.city = Some(update.city.clone());
                p.role = update.role;
                p.clone()
            }
            None => {
                let p = Profile {
                    id: update.id.clone(),
                    full_name: update.full_name.clone(),
                    username: Some(update.username.clone()),
                    phone: Some(update.phone.clone()),
                    avatar_url: None,
                    city: Some(update.city.clone()),
                    country: None,
                    role: update.role,
                    rating: 0.0,
                    reviews_count: 0,
                    is_verified: false,
                    created_at: update.updated_at,
                    last_seen_at: None,
                };
                state.profiles.push(p.clone());
                p
            }
        };
        state.emit_update(PROFILES, &profile);
        Ok(profile)
    }

    async fn set_avatar_url(&self, profile_id: &str, url: &str) -> Result<()> {
        let mut state = self.state();
        state.check_write(PROFILES)?;
        let profile = state
            .profiles
            .iter_mut()
            .find(|p| p.id == profile_id)
            .ok_or_else(|| Error::NotFound(format!("profile {}", profile_id)))?;
        profile.avatar_url = Some(url.to_string());
        let profile = profile.clone();
        state.emit_update(PROFILES, &profile);
        Ok(())
    }

    async fn apply_rating(&self, profile_id: &str, stars: u8) -> Result<Profile> {
        // single lock: the read and write of the aggregate cannot interleave
        let mut state = self.state();
        state.check_write(PROFILES)?;
        let profile = state
            .profiles
            .iter_mut()
            .find(|p| p.id == profile_id)
            .ok_or_else(|| Error::NotFound(format!("profile {}", profile_id)))?;
        let (rating, count) = aggregate(profile.rating, profile.reviews_count, stars);
        profile.rating = rating;
        profile.reviews_count = count;
        let profile = profile.clone();
        state.emit_update(PROFILES, &profile);
        Ok(profile)
    }

    async fn has_review(&self, profile_id: &str, user_id: &str) -> Result<bool> {
        let state = self.state();
        state.check_read(REVIEWS)?;
        Ok(state
            .reviews
            .iter()
            .any(|r| r.profile_id == profile_id && r.user_id == user_id))
    }

    async fn insert_review(&self, review: &NewReview) -> Result<()> {
        let mut state = self.state();
        state.check_write(REVIEWS)?;
        state.reviews.push(review.clone());
        state.emit_insert(REVIEWS, review);
        Ok(())
    }

    async fn count_profiles(&self) -> Result<u64> {
        let state = self.state();
        state.check_read(PROFILES)?;
        Ok(state.profiles.len() as u64)
    }

    async fn list_requests(&self, query: &RequestQuery) -> Result<Vec<ServiceRequest>> {
        let state = self.state();
        state.check_read(REQUESTS)?;
        Ok(state
            .requests
            .iter()
            .filter(|r| query.status.map_or(true, |s| r.status == s))
            .filter(|r| query.requester_id.as_deref().map_or(true, |id| r.requester_id == id))
            .filter(|r| query.created_after.map_or(true, |after| r.created_at > after))
            .map(|r| state.with_owner(r))
            .collect())
    }

    async fn get_request(&self, id: &str) -> Result<Option<ServiceRequest>> {
        let state = self.state();
        state.check_read(REQUESTS)?;
        Ok(state.requests.iter().find(|r| r.id == id).map(|r| state.with_owner(r)))
    }

    async fn insert_request(&self, request: &NewServiceRequest) -> Result<ServiceRequest> {
        let mut state = self.state();
        state.check_write(REQUESTS)?;
        let row = ServiceRequest {
            id: Uuid::new_v4().to_string(),
            requester_id: request.requester_id.clone(),
            note: Some(request.note.clone()),
            latitude: request.latitude,
            longitude: request.longitude,
            status: request.status,
            created_at: Utc::now(),
            owner: None,
        };
        state.requests.push(row.clone());
        state.emit_insert(REQUESTS, &row);
        Ok(state.with_owner(&row))
    }

    async fn delete_request(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.check_write(REQUESTS)?;
        if let Some(idx) = state.requests.iter().position(|r| r.id == id) {
            let removed = state.requests.remove(idx);
            state.emit_delete(REQUESTS, &removed);
        }
        Ok(())
    }

    async fn count_requests(&self, status: Option<RequestStatus>) -> Result<u64> {
        let state = self.state();
        state.check_read(REQUESTS)?;
        Ok(state
            .requests
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .count() as u64)
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let state = self.state();
        state.check_read(CONVERSATIONS)?;
        let mut found: Vec<Conversation> = state
            .conversations
            .iter()
            .filter(|c| c.involves(user_id))
            .map(|c| state.with_participants(c))
            .collect();
        found.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(found)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let state = self.state();
        state.check_read(CONVERSATIONS)?;
        Ok(state
            .conversations
            .iter()
            .find(|c| c.id == id)
            .map(|c| state.with_participants(c)))
    }

    async fn find_conversation(&self, lookup: &ConversationLookup) -> Result<Option<Conversation>> {
        let state = self.state();
        state.check_read(CONVERSATIONS)?;
        let found = state.conversations.iter().find(|c| match lookup {
            ConversationLookup::ForRequest { request_id, donor_id } => {
                c.request_id.as_deref() == Some(request_id.as_str()) && &c.donor_id == donor_id
            }
            ConversationLookup::BetweenUsers { first, second } => {
                (&c.donor_id == first && &c.requester_id == second) || (&c.donor_id == second && &c.requester_id == first)
            }
        });
        Ok(found.cloned())
    }

    async fn insert_conversation(&self, conversation: &NewConversation) -> Result<Conversation> {
        let mut state = self.state();
        state.check_write(CONVERSATIONS)?;
        let row = Conversation {
            id: Uuid::new_v4().to_string(),
            request_id: conversation.request_id.clone(),
            donor_id: conversation.donor_id.clone(),
            requester_id: conversation.requester_id.clone(),
            last_message_at: conversation.last_message_at,
            donor_profile: None,
            requester_profile: None,
        };
        state.conversations.push(row.clone());
        state.emit_insert(CONVERSATIONS, &row);
        debug!("Created conversation {}", row.id);
        Ok(row)
    }

    async fn touch_conversation(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state();
        state.check_write(CONVERSATIONS)?;
        if let Some(conv) = state.conversations.iter_mut().find(|c| c.id == id) {
            conv.last_message_at = at;
            let conv = conv.clone();
            state.emit_update(CONVERSATIONS, &conv);
        }
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.check_write(CONVERSATIONS)?;
        if let Some(idx) = state.conversations.iter().position(|c| c.id == id) {
            let removed = state.conversations.remove(idx);
            state.emit_delete(CONVERSATIONS, &removed);
        }
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let state = self.state();
        state.check_read(MESSAGES)?;
        let mut found: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message> {
        let mut state = self.state();
        state.check_write(MESSAGES)?;
        let row = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            text: Some(message.text.clone()),
            image_url: None,
            created_at: Utc::now(),
        };
        state.messages.push(row.clone());
        state.emit_insert(MESSAGES, &row);
        Ok(row)
    }

    async fn delete_message(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.check_write(MESSAGES)?;
        if let Some(idx) = state.messages.iter().position(|m| m.id == id) {
            let removed = state.messages.remove(idx);
            state.emit_delete(MESSAGES, &removed);
        }
        Ok(())
    }

    async fn delete_messages_in(&self, conversation_id: &str) -> Result<()> {
        let mut state = self.state();
        state.check_write(MESSAGES)?;
        let (removed, kept): (Vec<Message>, Vec<Message>) = std::mem::take(&mut state.messages)
            .into_iter()
            .partition(|m| m.conversation_id == conversation_id);
        state.messages = kept;
        for message in &removed {
            state.emit_delete(MESSAGES, message);
        }
        Ok(())
    }

    async fn upload_object(&self, bucket: &str, path: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        self.state().objects.insert(format!("{}/{}", bucket, path), bytes);
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("memory://storage/{}/{}", bucket, path)
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<mpsc::Receiver<ChangeEvent>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.state().subscribers.push((subscription.clone(), tx));
        Ok(rx)
    }
}
