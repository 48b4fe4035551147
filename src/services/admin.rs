use tracing::debug;

use crate::backend::Backend;
use crate::error::Result;
use crate::models::{PlatformStats, RequestStatus};

/// Totals shown on the admin dashboard
pub async fn platform_stats(backend: &dyn Backend) -> Result<PlatformStats> {
    let users = backend.count_profiles().await?;
    let requests = backend.count_requests(None).await?;
    let delivered = backend.count_requests(Some(RequestStatus::Delivered)).await?;
    debug!("Stats: {} users, {} requests, {} delivered", users, requests, delivered);

    Ok(PlatformStats {
        users,
        requests,
        delivered,
    })
}
