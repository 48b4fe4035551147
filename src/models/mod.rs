use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::note::NoteFields;

/// Account role stored on a profile
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Client,
    Technician,
    Admin,
    /// Legacy name for a technician account
    Requester,
    /// Legacy name for a client account
    Donor,
}

impl Role {
    /// Whether the account advertises services
    pub fn is_provider(self) -> bool {
        matches!(self, Role::Technician | Role::Requester)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Technician => "technician",
            Role::Admin => "admin",
            Role::Requester => "requester",
            Role::Donor => "donor",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(Role::Client),
            "technician" => Ok(Role::Technician),
            "admin" => Ok(Role::Admin),
            "requester" => Ok(Role::Requester),
            "donor" => Ok(Role::Donor),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Public profile row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub reviews_count: u32,
    #[serde(default)]
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Profile {
    /// Name shown in lists, falling back to the username
    pub fn display_name(&self) -> &str {
        if !self.full_name.trim().is_empty() {
            &self.full_name
        } else {
            self.username.as_deref().unwrap_or("مستخدم")
        }
    }
}

/// Fields a user may change on their own profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileUpdate {
    pub id: String,
    pub full_name: String,
    pub username: String,
    pub phone: String,
    pub city: String,
    pub role: Role,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of a listing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    #[default]
    Open,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
    Delivered,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Open => "open",
            RequestStatus::Assigned => "assigned",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Delivered => "delivered",
        }
    }
}

/// A listing row (`requests` table)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRequest {
    pub id: String,
    pub requester_id: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    /// Owner profile, embedded by the listing queries
    #[serde(default, rename = "profiles", skip_serializing_if = "Option::is_none")]
    pub owner: Option<Profile>,
}

impl ServiceRequest {
    /// Structured fields packed into the note column
    pub fn details(&self) -> NoteFields {
        NoteFields::decode(self.note.as_deref().unwrap_or(""))
    }

    /// Owner rating, zero when the profile was not embedded
    pub fn owner_rating(&self) -> f64 {
        self.owner.as_ref().map(|p| p.rating).unwrap_or(0.0)
    }
}

/// Insert payload for a new listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewServiceRequest {
    pub requester_id: String,
    pub note: String,
    pub latitude: f64,
    pub longitude: f64,
    pub status: RequestStatus,
}

/// Chat thread between two users
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub request_id: Option<String>,
    /// User who started the conversation
    pub donor_id: String,
    /// User who was contacted (listing owner)
    pub requester_id: String,
    pub last_message_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub donor_profile: Option<Profile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_profile: Option<Profile>,
}

impl Conversation {
    pub fn involves(&self, user_id: &str) -> bool {
        self.donor_id == user_id || self.requester_id == user_id
    }

    /// Id of the participant that is not `user_id`
    pub fn other_participant(&self, user_id: &str) -> &str {
        if self.donor_id == user_id {
            &self.requester_id
        } else {
            &self.donor_id
        }
    }

    /// Embedded profile of the participant that is not `user_id`
    pub fn other_profile(&self, user_id: &str) -> Option<&Profile> {
        if self.donor_id == user_id {
            self.requester_profile.as_ref()
        } else {
            self.donor_profile.as_ref()
        }
    }
}

/// Insert payload for a new conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewConversation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub donor_id: String,
    pub requester_id: String,
    pub last_message_at: DateTime<Utc>,
}

const TEMP_ID_PREFIX: &str = "temp-";
const MAPS_MARKER: &str = "google.com/maps";

/// Chat message row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Local placeholder shown until the insert is confirmed
    pub fn temporary(conversation_id: &str, sender_id: &str, text: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("{}{}", TEMP_ID_PREFIX, now.timestamp_millis()),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            text: Some(text.to_string()),
            image_url: None,
            created_at: now,
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }

    pub fn is_location(&self) -> bool {
        self.text.as_deref().map(|t| t.contains(MAPS_MARKER)).unwrap_or(false)
    }
}

/// Maps link shared as a location message
pub fn location_url(latitude: f64, longitude: f64) -> String {
    format!("https://www.{}?q={},{}", MAPS_MARKER, latitude, longitude)
}

/// Insert payload for a new message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
}

/// Review row, one per rater and target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewReview {
    pub profile_id: String,
    pub user_id: String,
    pub rating: u8,
}

/// Platform-wide counters for the admin view
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PlatformStats {
    pub users: u64,
    pub requests: u64,
    pub delivered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_message_is_marked() {
        let msg = Message::temporary("c1", "u1", "hello", Utc::now());
        assert!(msg.is_temporary());
        assert_eq!(msg.text.as_deref(), Some("hello"));
    }

    #[test]
    fn test_location_message_detection() {
        let url = location_url(31.95, 35.91);
        assert_eq!(url, "https://www.google.com/maps?q=31.95,35.91");

        let mut msg = Message::temporary("c1", "u1", &url, Utc::now());
        assert!(msg.is_location());
        msg.text = Some("see you at 5".to_string());
        assert!(!msg.is_location());
    }

    #[test]
    fn test_other_participant() {
        let conv = Conversation {
            id: "c1".to_string(),
            request_id: None,
            donor_id: "a".to_string(),
            requester_id: "b".to_string(),
            last_message_at: Utc::now(),
            donor_profile: None,
            requester_profile: None,
        };
        assert_eq!(conv.other_participant("a"), "b");
        assert_eq!(conv.other_participant("b"), "a");
        assert!(conv.involves("a"));
        assert!(!conv.involves("c"));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&RequestStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let role: Role = serde_json::from_str("\"technician\"").unwrap();
        assert!(role.is_provider());
    }
}
