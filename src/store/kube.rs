//! Kubernetes Object Store
//!
//! Adapts the cluster API server to the [`ObjectStore`] port. Spec writes go
//! through `replace`, status writes through the status subresource; both are
//! optimistic on the object's resource version. Watch streams come from the
//! runtime watcher, with create/modify disambiguated by a seen-UID set
//! (restart replays surface as modifies and are backstopped by the periodic
//! resync).

use crate::api::{Claim, Volume};
use crate::domain::ports::{ObjectStore, WatchEvent};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::watcher;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use tracing::warn;

// =============================================================================
// Kube Store
// =============================================================================

/// API-server-backed [`ObjectStore`].
pub struct KubeStore {
    volumes: Api<Volume>,
    claims: Api<Claim>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            volumes: Api::all(client.clone()),
            claims: Api::all(client),
        }
    }

    /// Map API-server failures onto the reconciliation taxonomy.
    fn classify(kind: &str, name: &str, err: kube::Error) -> Error {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Error::NotFound {
                kind: kind.into(),
                name: name.into(),
            },
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Error::AlreadyExists {
                    kind: kind.into(),
                    name: name.into(),
                }
            }
            kube::Error::Api(ae) if ae.code == 409 => Error::Conflict {
                kind: kind.into(),
                name: name.into(),
            },
            other => Error::Kube(other),
        }
    }

    fn watch_stream<K>(api: Api<K>) -> BoxStream<'static, WatchEvent<K>>
    where
        K: Resource<DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug
            + Send
            + Sync
            + 'static,
    {
        let mut seen: HashSet<String> = HashSet::new();
        watcher(api, watcher::Config::default())
            .map(move |item| {
                let mut out = Vec::new();
                match item {
                    Ok(watcher::Event::Applied(obj)) => {
                        let uid = obj.meta().uid.clone().unwrap_or_default();
                        if seen.insert(uid) {
                            out.push(WatchEvent::Created(obj));
                        } else {
                            out.push(WatchEvent::Modified(obj));
                        }
                    }
                    Ok(watcher::Event::Deleted(obj)) => {
                        if let Some(uid) = obj.meta().uid.as_deref() {
                            seen.remove(uid);
                        }
                        out.push(WatchEvent::Deleted(obj));
                    }
                    Ok(watcher::Event::Restarted(objs)) => {
                        for obj in objs {
                            seen.insert(obj.meta().uid.clone().unwrap_or_default());
                            out.push(WatchEvent::Modified(obj));
                        }
                    }
                    Err(err) => {
                        // The watcher re-establishes itself; nothing to do.
                        warn!(error = %err, "watch stream error");
                    }
                }
                futures::stream::iter(out)
            })
            .flatten()
            .boxed()
    }

    async fn replace_status<K>(api: &Api<K>, kind: &str, name: &str, obj: &K) -> Result<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
    {
        let data = serde_json::to_vec(obj)?;
        api.replace_status(name, &PostParams::default(), data)
            .await
            .map_err(|e| Self::classify(kind, name, e))
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_volume(&self, name: &str) -> Result<Option<Volume>> {
        self.volumes
            .get_opt(name)
            .await
            .map_err(|e| Self::classify("Volume", name, e))
    }

    async fn get_claim(&self, name: &str) -> Result<Option<Claim>> {
        self.claims
            .get_opt(name)
            .await
            .map_err(|e| Self::classify("Claim", name, e))
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.volumes
            .list(&ListParams::default())
            .await
            .map(|l| l.items)
            .map_err(|e| Self::classify("Volume", "", e))
    }

    async fn list_claims(&self) -> Result<Vec<Claim>> {
        self.claims
            .list(&ListParams::default())
            .await
            .map(|l| l.items)
            .map_err(|e| Self::classify("Claim", "", e))
    }

    async fn create_volume(&self, volume: &Volume) -> Result<Volume> {
        self.volumes
            .create(&PostParams::default(), volume)
            .await
            .map_err(|e| Self::classify("Volume", volume.name(), e))
    }

    async fn commit_volume(&self, volume: &Volume) -> Result<Volume> {
        self.volumes
            .replace(volume.name(), &PostParams::default(), volume)
            .await
            .map_err(|e| Self::classify("Volume", volume.name(), e))
    }

    async fn commit_volume_status(&self, volume: &Volume) -> Result<Volume> {
        Self::replace_status(&self.volumes, "Volume", volume.name(), volume).await
    }

    async fn commit_claim(&self, claim: &Claim) -> Result<Claim> {
        self.claims
            .replace(claim.name(), &PostParams::default(), claim)
            .await
            .map_err(|e| Self::classify("Claim", claim.name(), e))
    }

    async fn commit_claim_status(&self, claim: &Claim) -> Result<Claim> {
        Self::replace_status(&self.claims, "Claim", claim.name(), claim).await
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.volumes
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Self::classify("Volume", name, e))
    }

    fn watch_volumes(&self) -> BoxStream<'static, WatchEvent<Volume>> {
        Self::watch_stream(self.volumes.clone())
    }

    fn watch_claims(&self) -> BoxStream<'static, WatchEvent<Claim>> {
        Self::watch_stream(self.claims.clone())
    }
}
