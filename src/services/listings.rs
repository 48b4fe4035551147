use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::types::{ChangeEvent, ChangeFilter, ChangeKind, RequestQuery, Subscription, REQUESTS};
use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::models::{NewServiceRequest, RequestStatus, ServiceRequest};
use crate::note::{ContactPreference, NoteFields, NoteFilter};

pub const DEFAULT_RECENT_HOURS: i64 = 12;
const REFRESH_CAPACITY: usize = 8;

/// A listing with its note decoded
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub request: ServiceRequest,
    pub details: NoteFields,
    pub contact: ContactPreference,
}

impl From<ServiceRequest> for Listing {
    fn from(request: ServiceRequest) -> Self {
        let details = request.details();
        let contact = ContactPreference::from_note(request.note.as_deref().unwrap_or(""));
        Self {
            request,
            details,
            contact,
        }
    }
}

/// Browse filters: exact detail values plus a free-text search over the owner's names
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListingFilter {
    pub details: NoteFilter,
    pub search: Option<String>,
}

impl ListingFilter {
    pub fn matches(&self, listing: &Listing) -> bool {
        if !listing.details.matches(&self.details) {
            return false;
        }
        let term = match self.search.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_lowercase(),
            _ => return true,
        };
        let Some(owner) = &listing.request.owner else {
            return false;
        };
        owner.full_name.to_lowercase().contains(&term)
            || owner.username.as_deref().unwrap_or("").to_lowercase().contains(&term)
    }
}

/// Keep matching listings, best-rated owners first
pub fn apply_filter(listings: Vec<Listing>, filter: &ListingFilter) -> Vec<Listing> {
    let mut kept: Vec<Listing> = listings.into_iter().filter(|l| filter.matches(l)).collect();
    kept.sort_by(|a, b| b.request.owner_rating().total_cmp(&a.request.owner_rating()));
    kept
}

#[derive(Clone)]
pub struct ListingService {
    backend: Arc<dyn Backend>,
    user_id: Option<String>,
    recent_hours: i64,
}

impl ListingService {
    pub fn new(backend: Arc<dyn Backend>, user_id: Option<String>) -> Self {
        Self {
            backend,
            user_id,
            recent_hours: DEFAULT_RECENT_HOURS,
        }
    }

    pub fn with_recent_window(mut self, hours: i64) -> Self {
        self.recent_hours = hours;
        self
    }

    /// Start of the recent window, or a validation error when it cannot be represented
    fn recent_cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        TimeDelta::try_hours(self.recent_hours)
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or_else(|| Error::Validation(format!("recent window of {} hours is out of range", self.recent_hours)))
    }

    fn require_user(&self) -> Result<&str> {
        self.user_id
            .as_deref()
            .ok_or_else(|| Error::Validation("sign in required".to_string()))
    }

    /// Validate the form, encode the note, and store an open listing
    pub async fn publish(&self, fields: &NoteFields) -> Result<ServiceRequest> {
        let owner = self.require_user()?;
        fields.validate()?;
        let note = fields.encode()?;

        let created = self
            .backend
            .insert_request(&NewServiceRequest {
                requester_id: owner.to_string(),
                note,
                latitude: 0.0,
                longitude: 0.0,
                status: RequestStatus::Open,
            })
            .await?;
        info!("Published listing {} ({})", created.id, fields.service);
        Ok(created)
    }

    pub async fn browse(&self, filter: &ListingFilter) -> Result<Vec<Listing>> {
        let open = self.backend.list_requests(&RequestQuery::open()).await?;
        let total = open.len();
        let listings = apply_filter(open.into_iter().map(Listing::from).collect(), filter);
        debug!("{} of {} open listings match", listings.len(), total);
        Ok(listings)
    }

    pub async fn mine(&self) -> Result<Vec<Listing>> {
        let owner = self.require_user()?;
        let query = RequestQuery {
            requester_id: Some(owner.to_string()),
            ..RequestQuery::open()
        };
        let rows = self.backend.list_requests(&query).await?;
        Ok(rows.into_iter().map(Listing::from).collect())
    }

    /// Open listings created within the recent window
    pub async fn recent(&self) -> Result<Vec<Listing>> {
        let query = RequestQuery {
            created_after: Some(self.recent_cutoff(Utc::now())?),
            ..RequestQuery::open()
        };
        let rows = self.backend.list_requests(&query).await?;
        Ok(rows.into_iter().map(Listing::from).collect())
    }

    pub async fn get(&self, id: &str) -> Result<Listing> {
        self.backend
            .get_request(id)
            .await?
            .map(Listing::from)
            .ok_or_else(|| Error::NotFound(format!("listing {}", id)))
    }

    /// Owner-only delete
    pub async fn remove(&self, id: &str) -> Result<()> {
        let owner = self.require_user()?;
        let listing = self.get(id).await?;
        if listing.request.requester_id != owner {
            return Err(Error::Validation("only the owner can delete a listing".to_string()));
        }
        self.backend.delete_request(id).await?;
        info!("Deleted listing {}", id);
        Ok(())
    }

    pub fn subscription(&self) -> Subscription {
        Subscription::new("map_requests").on(ChangeFilter::new(ChangeKind::All, REQUESTS))
    }

    pub async fn watch(&self) -> Result<mpsc::Receiver<ChangeEvent>> {
        self.backend.subscribe(&self.subscription()).await
    }

    /// Re-run [`recent`](Self::recent) after every listing change.
    ///
    /// A burst of queued changes yields a single refresh. The stream ends when the
    /// subscription closes or the receiver is dropped.
    pub async fn follow_recent(&self) -> Result<mpsc::Receiver<Result<Vec<Listing>>>> {
        let mut events = self.watch().await?;
        let (tx, rx) = mpsc::channel(REFRESH_CAPACITY);
        let service = self.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let mut skipped = 0;
                while events.try_recv().is_ok() {
                    skipped += 1;
                }
                debug!("Listing {:?} on {} (+{} queued); refreshing", event.kind, event.table, skipped);
                let refreshed = service.recent().await;
                if let Err(err) = &refreshed {
                    warn!("Recent listings refresh failed: {}", err);
                }
                if tx.send(refreshed).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}
