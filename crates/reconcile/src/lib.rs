//! synk reconcile: one mirror pass per key, source cluster to destination cluster.
//!
//! A pass reads the source object, deletes the mirror when the source is gone,
//! otherwise provisions the destination namespace and writes the projected
//! payload with a single conditional read-modify-write.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use synk_core::{
    ClusterAccessor, NamespaceAccessor, Projector, Reconcile, Resource, SyncError, SyncKey, SyncResult, SyncStatus,
};
use tracing::{debug, info, warn};

mod kinds;
mod namespace;

pub use kinds::{FieldProjector, KindRegistry, KindSpec};
pub use namespace::{NamespaceProvisioner, NamespaceState};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Extra full passes attempted in-line after a version conflict.
    pub conflict_retries: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { conflict_retries: 3 }
    }
}

pub struct Reconciler {
    kind: String,
    source: Arc<dyn ClusterAccessor>,
    dest: Arc<dyn ClusterAccessor>,
    namespaces: NamespaceProvisioner,
    projector: Arc<dyn Projector>,
    cfg: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        spec: &KindSpec,
        source: Arc<dyn ClusterAccessor>,
        dest: Arc<dyn ClusterAccessor>,
        dest_namespaces: Arc<dyn NamespaceAccessor>,
    ) -> Self {
        Self {
            kind: spec.gvk.gvk_key(),
            source,
            dest,
            namespaces: NamespaceProvisioner::new(dest_namespaces),
            projector: spec.projector(),
            cfg: ReconcileConfig::default(),
        }
    }

    pub fn with_config(mut self, cfg: ReconcileConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Run passes for `key` until one completes without a version conflict
    /// or the conflict budget is spent.
    pub async fn reconcile_key(&self, key: &SyncKey) -> SyncResult<SyncStatus> {
        let t0 = Instant::now();
        let res = self.run(key).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(status) => {
                counter!("reconcile_total", 1u64, "status" => status.as_str());
                if status.mutated() {
                    info!(kind = %self.kind, key = %key, status = status.as_str(), "reconciled");
                } else {
                    debug!(kind = %self.kind, key = %key, status = status.as_str(), "reconciled");
                }
            }
            Err(e) => {
                counter!("reconcile_errors_total", 1u64, "class" => e.class().as_str());
            }
        }
        res
    }

    async fn run(&self, key: &SyncKey) -> SyncResult<SyncStatus> {
        key.validate()?;
        let mut attempt = 0u32;
        loop {
            match self.pass(key).await {
                Err(SyncError::Conflict(msg)) if attempt < self.cfg.conflict_retries => {
                    attempt += 1;
                    debug!(kind = %self.kind, key = %key, attempt, conflict = %msg, "destination changed underneath; re-running pass");
                }
                other => return other,
            }
        }
    }

    async fn pass(&self, key: &SyncKey) -> SyncResult<SyncStatus> {
        let source = match self.source.get(key).await {
            Ok(Some(obj)) => obj,
            Ok(None) | Err(SyncError::NotFound(_)) => return self.delete_destination(key).await,
            Err(e) => {
                warn!(kind = %self.kind, key = %key, error = %e, "fetching source object failed");
                return Err(e);
            }
        };
        debug!(kind = %self.kind, key = %key, "source object fetched");

        self.namespaces.ensure(&key.namespace).await?;

        let patch = self.projector.project(&source.payload);
        match self.dest.get(key).await? {
            None => {
                let mut obj = Resource::new(key.clone());
                patch.apply_to(&mut obj.payload);
                match self.dest.create(&obj).await {
                    Ok(_) => Ok(SyncStatus::Created),
                    // someone else created it between our read and write
                    Err(SyncError::AlreadyExists(m)) => Err(SyncError::Conflict(m)),
                    Err(e) => Err(e),
                }
            }
            Some(mut obj) => {
                if !patch.apply_to(&mut obj.payload) {
                    return Ok(SyncStatus::Unchanged);
                }
                match self.dest.update(&obj).await {
                    Ok(_) => Ok(SyncStatus::Updated),
                    // deleted between our read and write
                    Err(SyncError::NotFound(m)) => Err(SyncError::Conflict(m)),
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn delete_destination(&self, key: &SyncKey) -> SyncResult<SyncStatus> {
        match self.dest.delete(key).await {
            Ok(()) => Ok(SyncStatus::Deleted),
            Err(SyncError::NotFound(_)) => Ok(SyncStatus::AlreadyAbsent),
            Err(e) => {
                warn!(kind = %self.kind, key = %key, error = %e, "deleting destination object failed");
                Err(e)
            }
        }
    }
}

#[async_trait::async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, key: &SyncKey) -> SyncResult<SyncStatus> {
        self.reconcile_key(key).await
    }
}
