//! Lazily provisions destination namespaces. Never deletes them.

use std::sync::Arc;

use metrics::counter;
use synk_core::{NamespaceAccessor, SyncError, SyncResult};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceState {
    Present,
    Created,
    /// Lost a create race to a concurrent writer; the namespace exists.
    Raced,
}

pub struct NamespaceProvisioner {
    accessor: Arc<dyn NamespaceAccessor>,
}

impl NamespaceProvisioner {
    pub fn new(accessor: Arc<dyn NamespaceAccessor>) -> Self {
        Self { accessor }
    }

    /// Make sure `name` exists in the destination. No-op when it already does.
    pub async fn ensure(&self, name: &str) -> SyncResult<NamespaceState> {
        if self.accessor.namespace_exists(name).await? {
            return Ok(NamespaceState::Present);
        }
        match self.accessor.create_namespace(name).await {
            Ok(()) => {
                counter!("namespace_created_total", 1u64);
                info!(namespace = %name, "destination namespace created");
                Ok(NamespaceState::Created)
            }
            Err(SyncError::AlreadyExists(_)) => {
                debug!(namespace = %name, "namespace created concurrently");
                Ok(NamespaceState::Raced)
            }
            Err(e) => Err(e),
        }
    }
}
