#![allow(dead_code)]

//! In-memory cluster with resource versions and one-shot fault injection.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value as Json};
use synk_core::{ClusterAccessor, NamespaceAccessor, Resource, SyncError, SyncKey, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    Get,
    Create,
    Update,
    Delete,
    NamespaceGet,
    NamespaceCreate,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<SyncKey, Resource>,
    namespaces: BTreeSet<String>,
    next_rv: u64,
    log: Vec<String>,
    faults: BTreeMap<Op, SyncError>,
    conflict_next_update: bool,
    race_namespace_create: bool,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn fault(&mut self, op: Op) -> SyncResult<()> {
        match self.faults.remove(&op) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Default)]
pub struct MemCluster {
    inner: Arc<Mutex<State>>,
}

impl MemCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Out-of-band write, the way an external actor would create or edit.
    pub fn put(&self, key: &SyncKey, payload: Json) {
        let mut st = self.inner.lock().unwrap();
        st.namespaces.insert(key.namespace.clone());
        let rv = st.bump();
        let entry = st.objects.entry(key.clone()).or_insert_with(|| {
            let mut r = Resource::new(key.clone());
            r.metadata["uid"] = json!(format!("uid-{}", rv));
            r.metadata["creationTimestamp"] = json!("2024-01-01T00:00:00Z");
            r
        });
        entry.payload = payload;
        entry.metadata["resourceVersion"] = json!(rv);
    }

    /// Out-of-band metadata edit (labels, annotations, ...).
    pub fn set_metadata(&self, key: &SyncKey, field: &str, value: Json) {
        let mut st = self.inner.lock().unwrap();
        let rv = st.bump();
        if let Some(obj) = st.objects.get_mut(key) {
            obj.metadata[field] = value;
            obj.metadata["resourceVersion"] = json!(rv);
        }
    }

    pub fn remove(&self, key: &SyncKey) {
        self.inner.lock().unwrap().objects.remove(key);
    }

    pub fn add_namespace(&self, name: &str) {
        self.inner.lock().unwrap().namespaces.insert(name.to_string());
    }

    pub fn object(&self, key: &SyncKey) -> Option<Resource> {
        self.inner.lock().unwrap().objects.get(key).cloned()
    }

    pub fn payload(&self, key: &SyncKey) -> Option<Json> {
        self.object(key).map(|o| o.payload)
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.inner.lock().unwrap().namespaces.contains(name)
    }

    /// Mutations performed through the accessor traits, in order.
    pub fn log(&self) -> Vec<String> {
        self.inner.lock().unwrap().log.clone()
    }

    pub fn fail_next(&self, op: Op, err: SyncError) {
        self.inner.lock().unwrap().faults.insert(op, err);
    }

    /// Simulate a concurrent writer landing right before our next update.
    pub fn conflict_next_update(&self) {
        self.inner.lock().unwrap().conflict_next_update = true;
    }

    /// Simulate another reconcile creating the namespace first.
    pub fn race_namespace_create(&self) {
        self.inner.lock().unwrap().race_namespace_create = true;
    }
}

#[async_trait::async_trait]
impl ClusterAccessor for MemCluster {
    async fn get(&self, key: &SyncKey) -> SyncResult<Option<Resource>> {
        let mut st = self.inner.lock().unwrap();
        st.fault(Op::Get)?;
        Ok(st.objects.get(key).cloned())
    }

    async fn create(&self, obj: &Resource) -> SyncResult<Resource> {
        let mut st = self.inner.lock().unwrap();
        st.fault(Op::Create)?;
        if !st.namespaces.contains(&obj.key.namespace) {
            return Err(SyncError::NotFound(format!("namespaces \"{}\" not found", obj.key.namespace)));
        }
        if st.objects.contains_key(&obj.key) {
            return Err(SyncError::AlreadyExists(obj.key.to_string()));
        }
        if obj.resource_version().is_some() {
            return Err(SyncError::Fatal("resourceVersion should not be set on objects to be created".into()));
        }
        let rv = st.bump();
        let mut stored = obj.clone();
        stored.metadata["resourceVersion"] = json!(rv);
        stored.metadata["uid"] = json!(format!("uid-{}", rv));
        stored.metadata["creationTimestamp"] = json!("2024-06-01T00:00:00Z");
        st.objects.insert(obj.key.clone(), stored.clone());
        st.log.push(format!("create {}", obj.key));
        Ok(stored)
    }

    async fn update(&self, obj: &Resource) -> SyncResult<Resource> {
        let mut st = self.inner.lock().unwrap();
        st.fault(Op::Update)?;
        if std::mem::take(&mut st.conflict_next_update) {
            let rv = st.bump();
            if let Some(cur) = st.objects.get_mut(&obj.key) {
                cur.metadata["resourceVersion"] = json!(rv);
            }
        }
        let current_rv = match st.objects.get(&obj.key) {
            Some(cur) => cur.resource_version().map(str::to_string),
            None => return Err(SyncError::NotFound(obj.key.to_string())),
        };
        if obj.resource_version().map(str::to_string) != current_rv {
            return Err(SyncError::Conflict(format!(
                "{}: rv {:?} != {:?}",
                obj.key,
                obj.resource_version(),
                current_rv
            )));
        }
        let rv = st.bump();
        let mut stored = obj.clone();
        stored.metadata["resourceVersion"] = json!(rv);
        st.objects.insert(obj.key.clone(), stored.clone());
        st.log.push(format!("update {}", obj.key));
        Ok(stored)
    }

    async fn delete(&self, key: &SyncKey) -> SyncResult<()> {
        let mut st = self.inner.lock().unwrap();
        st.fault(Op::Delete)?;
        match st.objects.remove(key) {
            Some(_) => {
                st.log.push(format!("delete {}", key));
                Ok(())
            }
            None => Err(SyncError::NotFound(key.to_string())),
        }
    }

    async fn list_keys(&self, namespace: Option<&str>) -> SyncResult<Vec<SyncKey>> {
        let st = self.inner.lock().unwrap();
        Ok(st
            .objects
            .keys()
            .filter(|k| namespace.map(|n| k.namespace == n).unwrap_or(true))
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl NamespaceAccessor for MemCluster {
    async fn namespace_exists(&self, name: &str) -> SyncResult<bool> {
        let mut st = self.inner.lock().unwrap();
        st.fault(Op::NamespaceGet)?;
        Ok(st.namespaces.contains(name))
    }

    async fn create_namespace(&self, name: &str) -> SyncResult<()> {
        let mut st = self.inner.lock().unwrap();
        st.fault(Op::NamespaceCreate)?;
        if std::mem::take(&mut st.race_namespace_create) {
            st.namespaces.insert(name.to_string());
        }
        if !st.namespaces.insert(name.to_string()) {
            return Err(SyncError::AlreadyExists(format!("namespaces \"{}\" already exists", name)));
        }
        st.log.push(format!("create namespace {}", name));
        Ok(())
    }
}
