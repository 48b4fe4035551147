use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::types::{ChangeEvent, ConversationLookup, ProfileQuery, RequestQuery, Subscription};
use crate::error::Result;
use crate::models::{
    Conversation, Message, NewConversation, NewMessage, NewReview, NewServiceRequest, Profile, ProfileUpdate,
    RequestStatus, ServiceRequest,
};

/// Operations the marketplace needs from the hosted platform.
///
/// Implemented over HTTP by `RestBackend` and in-process by `MemoryBackend`.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get_profile(&self, id: &str) -> Result<Option<Profile>>;

    async fn search_profiles(&self, query: &ProfileQuery) -> Result<Vec<Profile>>;

    /// Another profile already using `username` or `full_name`
    async fn find_profile_conflict(&self, exclude_id: &str, username: &str, full_name: &str)
        -> Result<Option<Profile>>;

    async fn upsert_profile(&self, update: &ProfileUpdate) -> Result<Profile>;

    async fn set_avatar_url(&self, profile_id: &str, url: &str) -> Result<()>;

    /// Fold one rating into the target's running mean and return the updated profile
    async fn apply_rating(&self, profile_id: &str, stars: u8) -> Result<Profile>;

    async fn has_review(&self, profile_id: &str, user_id: &str) -> Result<bool>;

    async fn insert_review(&self, review: &NewReview) -> Result<()>;

    async fn count_profiles(&self) -> Result<u64>;

    async fn list_requests(&self, query: &RequestQuery) -> Result<Vec<ServiceRequest>>;

    async fn get_request(&self, id: &str) -> Result<Option<ServiceRequest>>;

    async fn insert_request(&self, request: &NewServiceRequest) -> Result<ServiceRequest>;

    async fn delete_request(&self, id: &str) -> Result<()>;

    async fn count_requests(&self, status: Option<RequestStatus>) -> Result<u64>;

    /// Conversations the user takes part in, most recent activity first
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    async fn find_conversation(&self, lookup: &ConversationLookup) -> Result<Option<Conversation>>;

    async fn insert_conversation(&self, conversation: &NewConversation) -> Result<Conversation>;

    async fn touch_conversation(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn delete_conversation(&self, id: &str) -> Result<()>;

    /// Messages of a conversation, oldest first
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    async fn insert_message(&self, message: &NewMessage) -> Result<Message>;

    async fn delete_message(&self, id: &str) -> Result<()>;

    async fn delete_messages_in(&self, conversation_id: &str) -> Result<()>;

    async fn upload_object(&self, bucket: &str, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    fn public_url(&self, bucket: &str, path: &str) -> String;

    /// Start receiving row changes for a channel
    async fn subscribe(&self, subscription: &Subscription) -> Result<mpsc::Receiver<ChangeEvent>>;
}
