//! synk core types: sync keys, mirrored resources and the seams between
//! the reconciler and the clusters it talks to.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

mod error;

pub use error::{ErrorClass, SyncError, SyncResult};

/// Longest object name the API server accepts.
const MAX_NAME_LEN: usize = 253;

/// Identity of a logical resource, shared by the source object and its mirror.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncKey {
    pub namespace: String,
    pub name: String,
}

impl SyncKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Reject keys no cluster could ever hold. Retrying these is pointless.
    pub fn validate(&self) -> SyncResult<()> {
        for (what, v) in [("namespace", &self.namespace), ("name", &self.name)] {
            if v.is_empty() {
                return Err(SyncError::Fatal(format!("malformed key {}: empty {}", self, what)));
            }
            if v.len() > MAX_NAME_LEN || v.contains('/') {
                return Err(SyncError::Fatal(format!("malformed key {}: invalid {}", self, what)));
            }
        }
        Ok(())
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for SyncKey {
    type Err = SyncError;

    /// Parses `namespace/name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ns, name) = s
            .split_once('/')
            .ok_or_else(|| SyncError::Fatal(format!("invalid key: {} (expect namespace/name)", s)))?;
        let key = SyncKey::new(ns, name);
        key.validate()?;
        Ok(key)
    }
}

/// Group/Version/Kind of the mirrored resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gvk_key())
    }
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> SyncResult<Gvk> {
    let parts: Vec<_> = key.split('/').collect();
    let gvk = match parts.as_slice() {
        [version, kind] => Gvk { group: String::new(), version: (*version).to_string(), kind: (*kind).to_string() },
        [group, version, kind] => Gvk { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() },
        _ => return Err(SyncError::Config(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
    };
    if gvk.version.is_empty() || gvk.kind.is_empty() {
        return Err(SyncError::Config(format!("invalid gvk key: {} (empty version or kind)", key)));
    }
    Ok(gvk)
}

/// One object as seen through a cluster accessor.
///
/// `metadata` is owned by the cluster holding the object (resourceVersion,
/// uid, creationTimestamp, labels, ...) and is carried through untouched.
/// `payload` is everything outside `metadata`/`apiVersion`/`kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub key: SyncKey,
    pub metadata: Json,
    pub payload: Json,
}

impl Resource {
    /// Bare reference: identity only, empty payload.
    pub fn new(key: SyncKey) -> Self {
        let metadata = serde_json::json!({ "name": key.name, "namespace": key.namespace });
        Self { key, metadata, payload: Json::Object(serde_json::Map::new()) }
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.get("resourceVersion").and_then(|v| v.as_str())
    }
}

/// Field-level patch produced by a [`Projector`].
///
/// `Some(v)` sets a top-level payload field, `None` removes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadPatch {
    pub fields: BTreeMap<String, Option<Json>>,
}

impl PayloadPatch {
    pub fn set(&mut self, field: impl Into<String>, value: Option<Json>) {
        self.fields.insert(field.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Apply to a payload in place. Returns whether anything changed.
    pub fn apply_to(&self, payload: &mut Json) -> bool {
        if !payload.is_object() {
            *payload = Json::Object(serde_json::Map::new());
        }
        let Some(obj) = payload.as_object_mut() else { return false };
        let mut changed = false;
        for (field, value) in &self.fields {
            match value {
                Some(v) => {
                    if obj.get(field) != Some(v) {
                        obj.insert(field.clone(), v.clone());
                        changed = true;
                    }
                }
                None => {
                    if obj.remove(field).is_some() {
                        changed = true;
                    }
                }
            }
        }
        changed
    }
}

/// Maps a source payload onto the destination fields it owns.
///
/// Implementations must be pure: same input, same patch.
pub trait Projector: Send + Sync {
    fn project(&self, source: &Json) -> PayloadPatch;
}

/// Object access against one cluster for one resource kind.
#[async_trait::async_trait]
pub trait ClusterAccessor: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, key: &SyncKey) -> SyncResult<Option<Resource>>;
    /// Fails with [`SyncError::AlreadyExists`] if the key is taken.
    async fn create(&self, obj: &Resource) -> SyncResult<Resource>;
    /// Conditional on `obj`'s resourceVersion; stale writes fail with [`SyncError::Conflict`].
    async fn update(&self, obj: &Resource) -> SyncResult<Resource>;
    /// Fails with [`SyncError::NotFound`] when there is nothing to delete.
    async fn delete(&self, key: &SyncKey) -> SyncResult<()>;
    /// Enumerate keys, optionally restricted to one namespace.
    async fn list_keys(&self, namespace: Option<&str>) -> SyncResult<Vec<SyncKey>>;
}

/// Namespace reads and creates against one cluster.
#[async_trait::async_trait]
pub trait NamespaceAccessor: Send + Sync {
    async fn namespace_exists(&self, name: &str) -> SyncResult<bool>;
    /// Fails with [`SyncError::AlreadyExists`] when another writer got there first.
    async fn create_namespace(&self, name: &str) -> SyncResult<()>;
}

/// Terminal state reached by a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Created,
    Updated,
    Unchanged,
    Deleted,
    AlreadyAbsent,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Created => "created",
            SyncStatus::Updated => "updated",
            SyncStatus::Unchanged => "unchanged",
            SyncStatus::Deleted => "deleted",
            SyncStatus::AlreadyAbsent => "already_absent",
        }
    }

    /// Whether the pass wrote to the destination.
    pub fn mutated(self) -> bool {
        matches!(self, SyncStatus::Created | SyncStatus::Updated | SyncStatus::Deleted)
    }
}

/// What the caller should do with a key after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Action {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl Action {
    /// Nothing to do until the next delivered event.
    pub fn await_change() -> Self {
        Self { requeue: false, requeue_after: None }
    }

    pub fn requeue_after(after: Duration) -> Self {
        Self { requeue: true, requeue_after: Some(after) }
    }
}

/// One synchronization pass for a key. Must be idempotent.
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, key: &SyncKey) -> SyncResult<SyncStatus>;
}

pub mod prelude {
    pub use super::{
        Action, ClusterAccessor, Gvk, NamespaceAccessor, PayloadPatch, Projector, Reconcile, Resource, SyncError,
        SyncKey, SyncResult, SyncStatus,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sync_key_roundtrips_through_display() {
        let k: SyncKey = "team-a/db-creds".parse().expect("ok");
        assert_eq!(k, SyncKey::new("team-a", "db-creds"));
        assert_eq!(k.to_string(), "team-a/db-creds");
    }

    #[test]
    fn malformed_keys_are_fatal() {
        assert!(matches!("no-slash".parse::<SyncKey>(), Err(SyncError::Fatal(_))));
        assert!(matches!("/name".parse::<SyncKey>(), Err(SyncError::Fatal(_))));
        assert!(matches!("ns/".parse::<SyncKey>(), Err(SyncError::Fatal(_))));
        assert!(matches!("a/b/c".parse::<SyncKey>(), Err(SyncError::Fatal(_))));
        assert!(SyncKey::new("ns", "x".repeat(254)).validate().is_err());
    }

    #[test]
    fn parse_gvk_key_parses_core_and_group() {
        let core = parse_gvk_key("v1/Secret").expect("ok");
        assert_eq!(core.group, "");
        assert_eq!(core.api_version(), "v1");
        assert_eq!(core.gvk_key(), "v1/Secret");

        let apps = parse_gvk_key("apps/v1/Deployment").expect("ok");
        assert_eq!(apps.group, "apps");
        assert_eq!(apps.api_version(), "apps/v1");
        assert_eq!(apps.to_string(), "apps/v1/Deployment");
    }

    #[test]
    fn parse_gvk_key_invalid_returns_config_err() {
        assert!(matches!(parse_gvk_key("invalid"), Err(SyncError::Config(_))));
        assert!(matches!(parse_gvk_key(""), Err(SyncError::Config(_))));
        assert!(matches!(parse_gvk_key("a/b/c/d"), Err(SyncError::Config(_))));
        assert!(matches!(parse_gvk_key("v1/"), Err(SyncError::Config(_))));
    }

    #[test]
    fn bare_resource_carries_identity_only() {
        let r = Resource::new(SyncKey::new("a", "x"));
        assert_eq!(r.metadata, json!({"name": "x", "namespace": "a"}));
        assert_eq!(r.payload, json!({}));
        assert_eq!(r.resource_version(), None);
    }

    #[test]
    fn patch_reports_changes_and_leaves_other_fields() {
        let mut patch = PayloadPatch::default();
        patch.set("data", Some(json!({"k": "v1"})));
        patch.set("binaryData", None);

        let mut payload = json!({"type": "Opaque", "binaryData": {"b": "AA=="}});
        assert!(patch.apply_to(&mut payload));
        assert_eq!(payload, json!({"type": "Opaque", "data": {"k": "v1"}}));

        // second application is a no-op
        assert!(!patch.apply_to(&mut payload));
    }

    #[test]
    fn patch_on_non_object_payload_starts_fresh() {
        let mut patch = PayloadPatch::default();
        patch.set("spec", Some(json!({"replicas": 2})));
        let mut payload = Json::Null;
        assert!(patch.apply_to(&mut payload));
        assert_eq!(payload, json!({"spec": {"replicas": 2}}));
    }

    #[test]
    fn status_mutation_flags() {
        assert!(SyncStatus::Created.mutated());
        assert!(SyncStatus::Deleted.mutated());
        assert!(!SyncStatus::Unchanged.mutated());
        assert!(!SyncStatus::AlreadyAbsent.mutated());
    }
}
