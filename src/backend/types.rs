use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::RequestStatus;

pub const PROFILES: &str = "profiles";
pub const REQUESTS: &str = "requests";
pub const CONVERSATIONS: &str = "conversations";
pub const MESSAGES: &str = "messages";
pub const REVIEWS: &str = "reviews";

pub const AVATARS_BUCKET: &str = "avatars";

/// Profile search parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileQuery {
    /// Case-insensitive substring over full name or username
    pub search: Option<String>,
    /// Only technician accounts
    pub providers_only: bool,
    pub limit: usize,
}

impl Default for ProfileQuery {
    fn default() -> Self {
        Self {
            search: None,
            providers_only: false,
            limit: 15,
        }
    }
}

/// Listing fetch parameters; results always embed the owner profile
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestQuery {
    pub status: Option<RequestStatus>,
    pub requester_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
}

impl RequestQuery {
    pub fn open() -> Self {
        Self {
            status: Some(RequestStatus::Open),
            ..Default::default()
        }
    }
}

/// Ways to find an existing conversation before creating one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationLookup {
    /// Conversation a user opened about a specific listing
    ForRequest { request_id: String, donor_id: String },
    /// Any conversation between two users, in either direction
    BetweenUsers { first: String, second: String },
}

/// Row change kind as reported by the realtime service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    #[serde(rename = "*")]
    All,
}

impl ChangeKind {
    pub fn covers(self, other: ChangeKind) -> bool {
        self == ChangeKind::All || self == other
    }
}

/// One table change of interest to a subscription
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeFilter {
    #[serde(rename = "event")]
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl ChangeFilter {
    pub fn new(kind: ChangeKind, table: &str) -> Self {
        Self {
            kind,
            schema: "public".to_string(),
            table: table.to_string(),
            filter: None,
        }
    }

    /// Restrict to rows where `column` equals `value`
    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.filter = Some(format!("{}=eq.{}", column, value));
        self
    }

    /// Whether an event falls under this filter; only `col=eq.value` filters are understood
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if self.table != event.table || !self.kind.covers(event.kind) {
            return false;
        }
        let Some(filter) = &self.filter else {
            return true;
        };
        let Some((column, value)) = filter.split_once("=eq.") else {
            return true;
        };
        let row = if event.kind == ChangeKind::Delete {
            &event.old_record
        } else {
            &event.record
        };
        match row.get(column) {
            Some(Value::String(s)) => s == value,
            Some(other) => other.to_string() == value,
            None => false,
        }
    }
}

/// A named realtime channel and the changes it listens to
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub channel: String,
    pub changes: Vec<ChangeFilter>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            changes: Vec::new(),
        }
    }

    pub fn on(mut self, change: ChangeFilter) -> Self {
        self.changes.push(change);
        self
    }

    pub fn wants(&self, event: &ChangeEvent) -> bool {
        self.changes.iter().any(|c| c.matches(event))
    }
}

/// Row change pushed by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub record: Value,
    pub old_record: Value,
}

impl ChangeEvent {
    pub fn new(table: &str, kind: ChangeKind, record: Value, old_record: Value) -> Self {
        Self {
            table: table.to_string(),
            kind,
            record,
            old_record,
        }
    }

    /// New row image, decoded
    pub fn decode_record<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.record.clone()).ok()
    }

    /// Primary key of the row before the change
    pub fn old_id(&self) -> Option<&str> {
        self.old_record.get("id").and_then(Value::as_str)
    }
}
