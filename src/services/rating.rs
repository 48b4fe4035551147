use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::local_store::LocalStore;
use crate::models::{NewReview, Profile};

pub const MIN_STARS: u8 = 1;
pub const MAX_STARS: u8 = 5;

/// Fold one rating into a running mean, rounded to two decimals
pub fn aggregate(mean: f64, count: u32, stars: u8) -> (f64, u32) {
    let new_count = count + 1;
    let new_mean = (mean * count as f64 + stars as f64) / new_count as f64;
    ((new_mean * 100.0).round() / 100.0, new_count)
}

/// Rating of other users' profiles, at most once per rater and target
pub struct RatingService {
    backend: Arc<dyn Backend>,
    store: LocalStore,
    user_id: String,
}

impl RatingService {
    pub fn new(backend: Arc<dyn Backend>, store: LocalStore, user_id: impl Into<String>) -> Self {
        Self {
            backend,
            store,
            user_id: user_id.into(),
        }
    }

    fn key(&self) -> String {
        format!("rated_v4_{}", self.user_id)
    }

    fn rated_ids(&self) -> Vec<String> {
        self.store.get(&self.key()).unwrap_or_default()
    }

    pub fn rated_locally(&self, profile_id: &str) -> bool {
        self.rated_ids().iter().any(|id| id == profile_id)
    }

    fn remember(&self, profile_id: &str) -> Result<()> {
        let mut ids = self.rated_ids();
        if !ids.iter().any(|id| id == profile_id) {
            ids.push(profile_id.to_string());
        }
        self.store.set(&self.key(), &ids)
    }

    /// Local guard first, then the reviews table; a failing remote check counts as not rated
    pub async fn already_rated(&self, profile_id: &str) -> bool {
        if self.rated_locally(profile_id) {
            return true;
        }
        match self.backend.has_review(profile_id, &self.user_id).await {
            Ok(found) => found,
            Err(err) => {
                debug!("Review check skipped: {}", err);
                false
            }
        }
    }

    pub async fn rate(&self, profile_id: &str, stars: u8) -> Result<Profile> {
        if !(MIN_STARS..=MAX_STARS).contains(&stars) {
            return Err(Error::Validation(format!(
                "rating must be between {} and {}",
                MIN_STARS, MAX_STARS
            )));
        }
        if profile_id == self.user_id {
            return Err(Error::Validation("You cannot rate yourself".to_string()));
        }
        if self.already_rated(profile_id).await {
            return Err(Error::Conflict(format!("profile {} already rated", profile_id)));
        }

        let review = NewReview {
            profile_id: profile_id.to_string(),
            user_id: self.user_id.clone(),
            rating: stars,
        };
        if let Err(err) = self.backend.insert_review(&review).await {
            warn!("Review row not stored ({}); updating profile aggregate only", err);
        }

        let profile = self.backend.apply_rating(profile_id, stars).await?;
        if let Err(err) = self.remember(profile_id) {
            // the aggregate is already stored; only the local guard is missing
            warn!("Could not record rating of {} locally: {}", profile_id, err);
        }
        info!(
            "Rated {} with {} stars, now {:.2} over {} reviews",
            profile_id, stars, profile.rating, profile.reviews_count
        );
        Ok(profile)
    }
}
