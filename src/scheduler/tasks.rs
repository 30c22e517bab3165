use std::sync::Arc;

use tracing::{info, warn};

use crate::scheduler::{JobFuture, Scheduler};
use crate::store::{Storage, StoreStats};

/// Log that ingestion is alive along with the store's row counts.
/// Returns the counts that were logged.
pub async fn log_heartbeat(storage: &dyn Storage) -> Option<StoreStats> {
    match storage.stats().await {
        Ok(stats) => {
            info!(
                messages = stats.messages,
                media_pending = stats.media_pending,
                media_fetched = stats.media_fetched,
                media_failed = stats.media_failed,
                "Heartbeat: ingestion is alive"
            );
            Some(stats)
        }
        Err(e) => {
            warn!(error = %e, "Heartbeat: failed to read store stats");
            None
        }
    }
}

/// Register the store heartbeat on `cron_expr`.
pub async fn register_heartbeat(
    scheduler: &Scheduler,
    cron_expr: &str,
    storage: Arc<dyn Storage>,
) -> anyhow::Result<()> {
    scheduler
        .add_cron_job(cron_expr, "heartbeat", move || -> JobFuture {
            let storage = Arc::clone(&storage);
            Box::pin(async move {
                log_heartbeat(storage.as_ref()).await;
            })
        })
        .await
}
