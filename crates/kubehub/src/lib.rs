//! synk kubehub: kube clients, kind discovery, cluster accessors and the source watcher.

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Config,
};
use synk_core::{Gvk, SyncKey};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod accessor;

pub use accessor::{classify, KubeAccessor};

/// Build a client from an explicit kubeconfig, or from the default chain
/// (`KUBECONFIG`, `~/.kube/config`, in-cluster) when no path is given.
pub async fn client_for(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let opts = KubeConfigOptions { context: context.map(str::to_string), ..Default::default() };
            Config::from_custom_kubeconfig(kc, &opts)
                .await
                .with_context(|| format!("loading kubeconfig {}", path.display()))?
        }
        None => Config::infer().await.context("inferring kube config")?,
    };
    Client::try_from(config).context("building kube client")
}

/// Resolve `gvk` against the cluster. Only namespaced kinds can be mirrored.
pub async fn resolve_kind(client: &Client, gvk: &Gvk) -> Result<ApiResource> {
    let kgvk = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
    let (ar, caps) = discovery::pinned_kind(client, &kgvk)
        .await
        .with_context(|| format!("GVK not found: {}", gvk))?;
    if !matches!(caps.scope, Scope::Namespaced) {
        return Err(anyhow!("{} is cluster-scoped; only namespaced kinds can be mirrored", gvk));
    }
    Ok(ar)
}

/// Watch the source kind and push the key of every touched object into `key_tx`.
///
/// Watch errors back off and resume. Returns when the receiver goes away.
pub async fn start_watcher(
    client: Client,
    ar: &ApiResource,
    namespace: Option<&str>,
    key_tx: mpsc::Sender<SyncKey>,
) -> Result<()> {
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client, ns, ar),
        None => Api::all_with(client, ar),
    };
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %ar.kind, ns = ?namespace, "watcher started");
    while let Some(ev) = stream.next().await {
        let keys: Vec<SyncKey> = match ev {
            Ok(Event::Applied(o)) | Ok(Event::Deleted(o)) => accessor::key_of(&o.metadata).into_iter().collect(),
            Ok(Event::Restarted(list)) => {
                debug!(count = list.len(), "watch restart");
                list.iter().filter_map(|o| accessor::key_of(&o.metadata)).collect()
            }
            Err(e) => {
                warn!(error = %e, "watch error; backing off");
                continue;
            }
        };
        for k in keys {
            if key_tx.send(k).await.is_err() {
                debug!("key receiver dropped; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!("watcher stream ended");
    Ok(())
}
