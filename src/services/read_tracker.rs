use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::Result;
use crate::local_store::LocalStore;
use crate::models::Conversation;

/// Per-user "last read" timestamps kept in client-local storage.
///
/// A conversation is unread when its last activity is strictly later than the
/// stored last-read time (the epoch when nothing is stored). Nothing here is
/// synced across devices.
#[derive(Debug, Clone)]
pub struct ReadTracker {
    store: LocalStore,
    user_id: String,
}

impl ReadTracker {
    pub fn new(store: LocalStore, user_id: impl Into<String>) -> Self {
        Self {
            store,
            user_id: user_id.into(),
        }
    }

    fn key(&self) -> String {
        format!("read_status_{}", self.user_id)
    }

    /// Stored entries; unparseable timestamps are skipped
    fn statuses(&self) -> BTreeMap<String, DateTime<Utc>> {
        let raw: BTreeMap<String, String> = self.store.get(&self.key()).unwrap_or_default();
        raw.into_iter()
            .filter_map(|(id, ts)| match DateTime::parse_from_rfc3339(&ts) {
                Ok(at) => Some((id, at.with_timezone(&Utc))),
                Err(_) => {
                    debug!("Skipping bad read timestamp for {}: {}", id, ts);
                    None
                }
            })
            .collect()
    }

    fn save(&self, statuses: &BTreeMap<String, DateTime<Utc>>) -> Result<()> {
        let raw: BTreeMap<&String, String> = statuses.iter().map(|(id, at)| (id, at.to_rfc3339())).collect();
        self.store.set(&self.key(), &raw)
    }

    pub fn last_read(&self, conversation_id: &str) -> DateTime<Utc> {
        self.statuses()
            .get(conversation_id)
            .copied()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn is_unread(&self, conversation: &Conversation) -> bool {
        conversation.last_message_at > self.last_read(&conversation.id)
    }

    pub fn unread_count(&self, conversations: &[Conversation]) -> usize {
        let statuses = self.statuses();
        conversations
            .iter()
            .filter(|c| {
                let last_read = statuses.get(&c.id).copied().unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                c.last_message_at > last_read
            })
            .count()
    }

    pub fn mark_read(&self, conversation_id: &str) -> Result<()> {
        self.mark_read_at(conversation_id, Utc::now())
    }

    pub fn mark_read_at(&self, conversation_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut statuses = self.statuses();
        statuses.insert(conversation_id.to_string(), at);
        self.save(&statuses)
    }

    /// Drop the entry of a deleted conversation
    pub fn forget(&self, conversation_id: &str) -> Result<()> {
        let mut statuses = self.statuses();
        if statuses.remove(conversation_id).is_some() {
            self.save(&statuses)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn conversation(id: &str, last: DateTime<Utc>) -> Conversation {
        Conversation {
            id: id.to_string(),
            request_id: None,
            donor_id: "a".to_string(),
            requester_id: "b".to_string(),
            last_message_at: last,
            donor_profile: None,
            requester_profile: None,
        }
    }

    #[test]
    fn test_never_read_is_unread() {
        let tracker = ReadTracker::new(LocalStore::in_memory(), "a");
        let conv = conversation("c1", Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap());
        assert_eq!(tracker.last_read("c1"), DateTime::<Utc>::UNIX_EPOCH);
        assert!(tracker.is_unread(&conv));
    }

    #[test]
    fn test_read_at_or_after_activity_is_read() {
        let tracker = ReadTracker::new(LocalStore::in_memory(), "a");
        let activity = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let conv = conversation("c1", activity);

        tracker.mark_read_at("c1", activity - Duration::seconds(1)).unwrap();
        assert!(tracker.is_unread(&conv));

        tracker.mark_read_at("c1", activity).unwrap();
        assert!(!tracker.is_unread(&conv));

        tracker.mark_read_at("c1", activity + Duration::minutes(5)).unwrap();
        assert!(!tracker.is_unread(&conv));
    }

    #[test]
    fn test_unread_count_and_isolation_between_users() {
        let store = LocalStore::in_memory();
        let alice = ReadTracker::new(store.clone(), "a");
        let bob = ReadTracker::new(store, "b");
        let now = Utc::now();
        let convs = vec![conversation("c1", now), conversation("c2", now)];

        alice.mark_read_at("c1", now).unwrap();
        assert_eq!(alice.unread_count(&convs), 1);
        assert_eq!(bob.unread_count(&convs), 2);
    }

    #[test]
    fn test_corrupt_entries_are_ignored() {
        let store = LocalStore::in_memory();
        store
            .set_raw("read_status_a", json!({"c1": "yesterday", "c2": "2025-03-01T10:00:00Z"}))
            .unwrap();
        let tracker = ReadTracker::new(store, "a");

        assert_eq!(tracker.last_read("c1"), DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(tracker.last_read("c2"), Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_forget_removes_entry() {
        let tracker = ReadTracker::new(LocalStore::in_memory(), "a");
        tracker.mark_read("c1").unwrap();
        tracker.forget("c1").unwrap();
        assert_eq!(tracker.last_read("c1"), DateTime::<Utc>::UNIX_EPOCH);
    }
}
