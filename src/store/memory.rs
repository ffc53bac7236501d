//! In-Memory Object Store
//!
//! A process-local store with the same commit semantics as the API server:
//! per-object optimistic writes keyed on resource version, spec and status
//! committed independently, and watch fan-out over broadcast channels.
//! Backs tests and `--standalone` mode.

use crate::api::{Claim, Volume};
use crate::domain::ports::{ObjectStore, WatchEvent};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Broadcast capacity; a lagging watcher drops events and is backstopped by
/// the periodic resync.
const WATCH_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Memory Store
// =============================================================================

/// In-memory [`ObjectStore`] with optimistic concurrency.
pub struct MemoryStore {
    volumes: DashMap<String, Volume>,
    claims: DashMap<String, Claim>,
    /// Monotonic resource-version counter shared by both kinds
    revision: AtomicU64,
    /// Monotonic UID counter; every create gets a fresh identity
    uid_seq: AtomicU64,
    volume_events: broadcast::Sender<WatchEvent<Volume>>,
    claim_events: broadcast::Sender<WatchEvent<Claim>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (volume_events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        let (claim_events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            volumes: DashMap::new(),
            claims: DashMap::new(),
            revision: AtomicU64::new(0),
            uid_seq: AtomicU64::new(0),
            volume_events,
            claim_events,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(&self) -> String {
        self.revision.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn next_uid(&self) -> String {
        format!("uid-{:06}", self.uid_seq.fetch_add(1, Ordering::SeqCst))
    }

    /// Seed or replace a claim, assigning identity. Claims are created by
    /// users, not the controller, so this sits outside the port.
    pub fn insert_claim(&self, mut claim: Claim) -> Claim {
        if claim.metadata.uid.is_none() {
            claim.metadata.uid = Some(self.next_uid());
        }
        claim.metadata.resource_version = Some(self.next_revision());
        let name = claim.name().to_string();
        self.claims.insert(name, claim.clone());
        let _ = self.claim_events.send(WatchEvent::Created(claim.clone()));
        claim
    }

    /// Seed a volume directly, assigning identity.
    pub fn insert_volume(&self, mut volume: Volume) -> Volume {
        if volume.metadata.uid.is_none() {
            volume.metadata.uid = Some(self.next_uid());
        }
        volume.metadata.resource_version = Some(self.next_revision());
        let name = volume.name().to_string();
        self.volumes.insert(name, volume.clone());
        let _ = self.volume_events.send(WatchEvent::Created(volume.clone()));
        volume
    }

    /// Remove a claim the way an external user would.
    pub fn delete_claim(&self, name: &str) -> Result<Claim> {
        match self.claims.remove(name) {
            Some((_, claim)) => {
                let _ = self.claim_events.send(WatchEvent::Deleted(claim.clone()));
                Ok(claim)
            }
            None => Err(Error::NotFound {
                kind: "Claim".into(),
                name: name.into(),
            }),
        }
    }

    fn check_volume_freshness(stored: &Volume, incoming: &Volume) -> Result<()> {
        let conflict = || Error::Conflict {
            kind: "Volume".into(),
            name: incoming.name().into(),
        };
        if incoming.metadata.uid.is_some() && incoming.metadata.uid != stored.metadata.uid {
            return Err(conflict());
        }
        if incoming.metadata.resource_version != stored.metadata.resource_version {
            return Err(conflict());
        }
        Ok(())
    }

    fn check_claim_freshness(stored: &Claim, incoming: &Claim) -> Result<()> {
        let conflict = || Error::Conflict {
            kind: "Claim".into(),
            name: incoming.name().into(),
        };
        if incoming.metadata.uid.is_some() && incoming.metadata.uid != stored.metadata.uid {
            return Err(conflict());
        }
        if incoming.metadata.resource_version != stored.metadata.resource_version {
            return Err(conflict());
        }
        Ok(())
    }

    fn subscribe<T: Clone + Send + 'static>(
        sender: &broadcast::Sender<WatchEvent<T>>,
    ) -> BoxStream<'static, WatchEvent<T>> {
        let rx = sender.subscribe();
        futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    // Dropped events are recovered by the periodic resync.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_volume(&self, name: &str) -> Result<Option<Volume>> {
        Ok(self.volumes.get(name).map(|r| r.value().clone()))
    }

    async fn get_claim(&self, name: &str) -> Result<Option<Claim>> {
        Ok(self.claims.get(name).map(|r| r.value().clone()))
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        Ok(self.volumes.iter().map(|r| r.value().clone()).collect())
    }

    async fn list_claims(&self) -> Result<Vec<Claim>> {
        Ok(self.claims.iter().map(|r| r.value().clone()).collect())
    }

    async fn create_volume(&self, volume: &Volume) -> Result<Volume> {
        let name = volume.name().to_string();
        if name.is_empty() {
            return Err(Error::Internal("volume create without a name".into()));
        }
        let mut created = volume.clone();
        created.metadata.uid = Some(self.next_uid());
        created.metadata.resource_version = Some(self.next_revision());
        match self.volumes.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::AlreadyExists {
                    kind: "Volume".into(),
                    name,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(created.clone());
            }
        }
        let _ = self.volume_events.send(WatchEvent::Created(created.clone()));
        Ok(created)
    }

    async fn commit_volume(&self, volume: &Volume) -> Result<Volume> {
        let name = volume.name().to_string();
        let mut entry = self.volumes.get_mut(&name).ok_or_else(|| Error::NotFound {
            kind: "Volume".into(),
            name: name.clone(),
        })?;
        Self::check_volume_freshness(&entry, volume)?;

        let mut updated = volume.clone();
        // Spec writes never carry status; keep whatever is stored.
        updated.status = entry.status.clone();
        updated.metadata.resource_version = Some(self.next_revision());
        *entry = updated.clone();
        drop(entry);
        let _ = self.volume_events.send(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn commit_volume_status(&self, volume: &Volume) -> Result<Volume> {
        let name = volume.name().to_string();
        let mut entry = self.volumes.get_mut(&name).ok_or_else(|| Error::NotFound {
            kind: "Volume".into(),
            name: name.clone(),
        })?;
        Self::check_volume_freshness(&entry, volume)?;

        let mut updated = entry.clone();
        updated.status = volume.status.clone();
        updated.metadata.resource_version = Some(self.next_revision());
        *entry = updated.clone();
        drop(entry);
        let _ = self.volume_events.send(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn commit_claim(&self, claim: &Claim) -> Result<Claim> {
        let name = claim.name().to_string();
        let mut entry = self.claims.get_mut(&name).ok_or_else(|| Error::NotFound {
            kind: "Claim".into(),
            name: name.clone(),
        })?;
        Self::check_claim_freshness(&entry, claim)?;

        let mut updated = claim.clone();
        updated.status = entry.status.clone();
        updated.metadata.resource_version = Some(self.next_revision());
        *entry = updated.clone();
        drop(entry);
        let _ = self.claim_events.send(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn commit_claim_status(&self, claim: &Claim) -> Result<Claim> {
        let name = claim.name().to_string();
        let mut entry = self.claims.get_mut(&name).ok_or_else(|| Error::NotFound {
            kind: "Claim".into(),
            name: name.clone(),
        })?;
        Self::check_claim_freshness(&entry, claim)?;

        let mut updated = entry.clone();
        updated.status = claim.status.clone();
        updated.metadata.resource_version = Some(self.next_revision());
        *entry = updated.clone();
        drop(entry);
        let _ = self.claim_events.send(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        match self.volumes.remove(name) {
            Some((_, volume)) => {
                let _ = self.volume_events.send(WatchEvent::Deleted(volume));
                Ok(())
            }
            None => Err(Error::NotFound {
                kind: "Volume".into(),
                name: name.into(),
            }),
        }
    }

    fn watch_volumes(&self) -> BoxStream<'static, WatchEvent<Volume>> {
        Self::subscribe(&self.volume_events)
    }

    fn watch_claims(&self) -> BoxStream<'static, WatchEvent<Claim>> {
        Self::subscribe(&self.claim_events)
    }
}
