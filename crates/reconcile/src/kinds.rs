//! Per-kind field projections and the table of kinds we know how to mirror.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as Json;
use synk_core::{parse_gvk_key, Gvk, PayloadPatch, Projector, SyncError, SyncResult};

/// Copies a fixed list of top-level payload fields verbatim.
///
/// A field missing from the source is removed from the destination, so a
/// source that drops `binaryData` converges to a mirror without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldProjector {
    fields: Vec<String>,
}

impl FieldProjector {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        fields.sort();
        fields.dedup();
        Self { fields }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

impl Projector for FieldProjector {
    fn project(&self, source: &Json) -> PayloadPatch {
        let mut patch = PayloadPatch::default();
        for f in &self.fields {
            patch.set(f.clone(), source.get(f).cloned());
        }
        patch
    }
}

/// A mirrored kind and the projection used for it.
#[derive(Debug, Clone)]
pub struct KindSpec {
    pub gvk: Gvk,
    pub fields: FieldProjector,
}

impl KindSpec {
    pub fn projector(&self) -> Arc<dyn Projector> {
        Arc::new(self.fields.clone())
    }
}

/// Static table of built-in projections keyed by GVK key.
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: BTreeMap<String, Vec<&'static str>>,
}

impl KindRegistry {
    pub fn builtin() -> Self {
        let mut kinds: BTreeMap<String, Vec<&'static str>> = BTreeMap::new();
        kinds.insert("v1/Secret".into(), vec!["data"]);
        kinds.insert("v1/ConfigMap".into(), vec!["data", "binaryData"]);
        for k in ["apps/v1/Deployment", "apps/v1/StatefulSet", "apps/v1/DaemonSet", "batch/v1/CronJob"] {
            kinds.insert(k.into(), vec!["spec"]);
        }
        Self { kinds }
    }

    /// Built-in entries as `(gvk key, fields)`, sorted by key.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[&'static str])> {
        self.kinds.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Look up `gvk_key`. An explicit field list wins over the built-in one and
    /// is the only way to mirror a kind the table does not know.
    pub fn resolve(&self, gvk_key: &str, fields_override: Option<&[String]>) -> SyncResult<KindSpec> {
        let gvk = parse_gvk_key(gvk_key)?;
        let fields = match fields_override {
            Some(list) => {
                let list: Vec<&str> = list.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
                if list.is_empty() {
                    return Err(SyncError::Config("empty field list".into()));
                }
                if let Some(bad) = list.iter().find(|f| matches!(**f, "metadata" | "apiVersion" | "kind")) {
                    return Err(SyncError::Config(format!("field {} is not part of the payload", bad)));
                }
                FieldProjector::new(list)
            }
            None => match self.kinds.get(&gvk.gvk_key()) {
                Some(list) => FieldProjector::new(list.iter().copied()),
                None => {
                    return Err(SyncError::Config(format!(
                        "no field mapping registered for {}; pass an explicit field list",
                        gvk
                    )))
                }
            },
        };
        Ok(KindSpec { gvk, fields })
    }
}
