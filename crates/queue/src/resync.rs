//! Periodic re-enqueue of every known key.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use synk_core::{ClusterAccessor, SyncKey, SyncResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait before retrying a listing that failed.
const RETRY_LISTING: Duration = Duration::from_secs(30);

/// Enqueue the union of source keys and, when given, destination keys.
///
/// Destination keys let orphans (mirrors whose source vanished while nobody
/// was watching) go through the regular delete path.
pub async fn enqueue_known(
    source: &dyn ClusterAccessor,
    dest: Option<&dyn ClusterAccessor>,
    namespace: Option<&str>,
    tx: &mpsc::Sender<SyncKey>,
) -> SyncResult<usize> {
    let mut keys: BTreeSet<SyncKey> = source.list_keys(namespace).await?.into_iter().collect();
    if let Some(dest) = dest {
        keys.extend(dest.list_keys(namespace).await?);
    }
    let n = keys.len();
    for k in keys {
        if tx.send(k).await.is_err() {
            break;
        }
    }
    Ok(n)
}

/// Run [`enqueue_known`] now and then every `period` (once when `None`)
/// until `shutdown` fires. Failed listings are retried.
pub fn spawn_resync(
    source: Arc<dyn ClusterAccessor>,
    dest: Option<Arc<dyn ClusterAccessor>>,
    namespace: Option<String>,
    period: Option<Duration>,
    tx: mpsc::Sender<SyncKey>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let wait = match enqueue_known(&*source, dest.as_deref(), namespace.as_deref(), &tx).await {
                Ok(n) => {
                    info!(keys = n, "resync enqueued");
                    match period {
                        Some(p) => p,
                        None => break,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "resync listing failed");
                    period.map_or(RETRY_LISTING, |p| p.min(RETRY_LISTING))
                }
            };
            if tx.is_closed() {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    })
}
