//! Cluster accessors over `Api<DynamicObject>` for a single discovered kind.

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use metrics::counter;
use synk_core::{ClusterAccessor, NamespaceAccessor, Resource, SyncError, SyncKey, SyncResult};
use tracing::debug;

/// Page size for key enumeration.
const LIST_PAGE: u32 = 500;

/// Map a kube error onto the sync taxonomy.
pub fn classify(err: kube::Error) -> SyncError {
    match err {
        kube::Error::Api(ae) => match ae.code {
            404 => SyncError::NotFound(ae.message),
            409 if ae.reason == "AlreadyExists" => SyncError::AlreadyExists(ae.message),
            409 => SyncError::Conflict(ae.message),
            401 => SyncError::Config(format!("unauthorized: {}", ae.message)),
            400 | 403 | 422 => SyncError::Fatal(format!("{} ({})", ae.message, ae.reason)),
            _ => SyncError::Transient(format!("{} ({})", ae.message, ae.code)),
        },
        kube::Error::Auth(e) => SyncError::Config(format!("auth: {}", e)),
        other => SyncError::Transient(other.to_string()),
    }
}

pub(crate) fn key_of(meta: &ObjectMeta) -> Option<SyncKey> {
    Some(SyncKey::new(meta.namespace.clone()?, meta.name.clone()?))
}

pub(crate) fn to_resource(obj: DynamicObject) -> SyncResult<Resource> {
    let key = key_of(&obj.metadata)
        .ok_or_else(|| SyncError::Fatal("object missing metadata.name or metadata.namespace".into()))?;
    let metadata = serde_json::to_value(&obj.metadata)?;
    Ok(Resource { key, metadata, payload: obj.data })
}

pub(crate) fn to_dynamic(ar: &ApiResource, res: &Resource) -> SyncResult<DynamicObject> {
    let mut obj = DynamicObject::new(&res.key.name, ar);
    obj.metadata = serde_json::from_value(res.metadata.clone())?;
    // identity always follows the key
    obj.metadata.name = Some(res.key.name.clone());
    obj.metadata.namespace = Some(res.key.namespace.clone());
    obj.data = res.payload.clone();
    Ok(obj)
}

/// Accessor for one cluster and one namespaced kind.
#[derive(Clone)]
pub struct KubeAccessor {
    client: Client,
    ar: ApiResource,
    cluster: &'static str,
}

impl KubeAccessor {
    /// `cluster` labels logs and metrics ("source", "destination").
    pub fn new(client: Client, ar: ApiResource, cluster: &'static str) -> Self {
        Self { client, ar, cluster }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.ar)
    }

    fn fail(&self, verb: &'static str, err: kube::Error) -> SyncError {
        let e = classify(err);
        if !e.is_not_found() {
            counter!("kube_errors_total", 1u64, "cluster" => self.cluster, "verb" => verb, "class" => e.class().as_str());
        }
        e
    }
}

#[async_trait::async_trait]
impl ClusterAccessor for KubeAccessor {
    async fn get(&self, key: &SyncKey) -> SyncResult<Option<Resource>> {
        match self.api(&key.namespace).get_opt(&key.name).await {
            Ok(Some(obj)) => Ok(Some(to_resource(obj)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(self.fail("get", e)),
        }
    }

    async fn create(&self, obj: &Resource) -> SyncResult<Resource> {
        let body = to_dynamic(&self.ar, obj)?;
        let created = self
            .api(&obj.key.namespace)
            .create(&PostParams::default(), &body)
            .await
            .map_err(|e| self.fail("create", e))?;
        debug!(cluster = self.cluster, key = %obj.key, "object created");
        to_resource(created)
    }

    async fn update(&self, obj: &Resource) -> SyncResult<Resource> {
        // PUT carries metadata.resourceVersion; the server rejects stale writes with 409.
        let body = to_dynamic(&self.ar, obj)?;
        if body.metadata.resource_version.is_none() {
            return Err(SyncError::Fatal(format!("{}: update without resourceVersion", obj.key)));
        }
        let updated = self
            .api(&obj.key.namespace)
            .replace(&obj.key.name, &PostParams::default(), &body)
            .await
            .map_err(|e| self.fail("update", e))?;
        debug!(cluster = self.cluster, key = %obj.key, rv = ?updated.metadata.resource_version, "object updated");
        to_resource(updated)
    }

    async fn delete(&self, key: &SyncKey) -> SyncResult<()> {
        self.api(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|e| self.fail("delete", e))?;
        debug!(cluster = self.cluster, key = %key, "object deleted");
        Ok(())
    }

    async fn list_keys(&self, namespace: Option<&str>) -> SyncResult<Vec<SyncKey>> {
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => self.api(ns),
            None => Api::all_with(self.client.clone(), &self.ar),
        };
        let mut out = Vec::new();
        let mut lp = ListParams::default().limit(LIST_PAGE);
        loop {
            let page = api.list_metadata(&lp).await.map_err(|e| self.fail("list", e))?;
            out.extend(page.items.iter().filter_map(|o| key_of(&o.metadata)));
            match page.metadata.continue_.filter(|t| !t.is_empty()) {
                Some(token) => lp = lp.continue_token(&token),
                None => break,
            }
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl NamespaceAccessor for KubeAccessor {
    async fn namespace_exists(&self, name: &str) -> SyncResult<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get_opt(name).await {
            Ok(found) => Ok(found.is_some()),
            Err(e) => Err(self.fail("get_namespace", e)),
        }
    }

    async fn create_namespace(&self, name: &str) -> SyncResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
            ..Default::default()
        };
        api.create(&PostParams::default(), &ns).await.map_err(|e| self.fail("create_namespace", e))?;
        Ok(())
    }
}
