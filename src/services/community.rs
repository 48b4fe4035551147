use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::backend::types::ProfileQuery;
use crate::backend::Backend;
use crate::error::Result;
use crate::models::Profile;

pub const SEARCH_LIMIT: usize = 30;
pub const TOP_LIMIT: usize = 15;
pub const TOP_PROVIDERS_LIMIT: usize = 3;

/// Strip `@` and whitespace from a typed handle
pub fn clean_query(raw: &str) -> String {
    raw.chars().filter(|c| *c != '@' && !c.is_whitespace()).collect()
}

#[derive(Clone)]
pub struct CommunityService {
    backend: Arc<dyn Backend>,
}

impl CommunityService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Name/username search, or the top-rated profiles for an empty query
    pub async fn search(&self, raw: &str) -> Result<Vec<Profile>> {
        let term = clean_query(raw);
        let query = if term.is_empty() {
            ProfileQuery {
                limit: TOP_LIMIT,
                ..Default::default()
            }
        } else {
            ProfileQuery {
                search: Some(term),
                providers_only: false,
                limit: SEARCH_LIMIT,
            }
        };
        self.backend.search_profiles(&query).await
    }

    pub async fn top_providers(&self) -> Result<Vec<Profile>> {
        self.backend
            .search_profiles(&ProfileQuery {
                search: None,
                providers_only: true,
                limit: TOP_PROVIDERS_LIMIT,
            })
            .await
    }
}

/// Result of one debounced search
#[derive(Debug)]
pub struct SearchOutcome {
    pub query: String,
    pub result: Result<Vec<Profile>>,
}

/// Search-as-you-type: each input restarts the delay and supersedes the pending query
pub struct SearchDebouncer {
    community: CommunityService,
    delay: Duration,
    pending: Option<JoinHandle<()>>,
    results: mpsc::Sender<SearchOutcome>,
}

impl SearchDebouncer {
    pub fn new(community: CommunityService, delay: Duration) -> (Self, mpsc::Receiver<SearchOutcome>) {
        let (results, rx) = mpsc::channel(16);
        let debouncer = Self {
            community,
            delay,
            pending: None,
            results,
        };
        (debouncer, rx)
    }

    pub fn input(&mut self, query: &str) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }

        let community = self.community.clone();
        let results = self.results.clone();
        let delay = self.delay;
        let query = query.to_string();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("Searching community for '{}'", query);
            let result = community.search(&query).await;
            let _ = results.send(SearchOutcome { query, result }).await;
        }));
    }
}

impl Drop for SearchDebouncer {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}
