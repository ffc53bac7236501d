//! Domain Ports - Core trait definitions for the volume binder
//!
//! These traits define the boundaries between the reconciliation logic and
//! external systems. Adapters implement these traits to provide concrete
//! functionality: the object store, the volume-matching predicate, the
//! reclaim/provisioning plugins, and the event sink.

use crate::api::{Claim, Volume};
use crate::error::Result;
use crate::events::{Event, EventReason};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

// =============================================================================
// Watch Events
// =============================================================================

/// A change notification from the object store.
///
/// Streams may replay and may coalesce; consumers must be idempotent.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Created(T),
    Modified(T),
    Deleted(T),
}

impl<T> WatchEvent<T> {
    /// The object carried by the event, whatever its variant.
    pub fn object(&self) -> &T {
        match self {
            WatchEvent::Created(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

// =============================================================================
// Object Store Port
// =============================================================================

/// Port for reading and committing Volumes and Claims.
///
/// Spec and status are committed separately: each is an independent
/// optimistic write keyed on the object's resource version, and either may
/// fail while the other has succeeded. Reconciliation must be safe under
/// such partial progress.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_volume(&self, name: &str) -> Result<Option<Volume>>;
    async fn get_claim(&self, name: &str) -> Result<Option<Claim>>;

    async fn list_volumes(&self) -> Result<Vec<Volume>>;
    async fn list_claims(&self) -> Result<Vec<Claim>>;

    /// Create a new Volume object (dynamic provisioning).
    async fn create_volume(&self, volume: &Volume) -> Result<Volume>;

    /// Commit the spec (and metadata) of a Volume; the stored status is
    /// preserved. Fails with `Conflict` when the resource version is stale.
    async fn commit_volume(&self, volume: &Volume) -> Result<Volume>;

    /// Commit only the status of a Volume.
    async fn commit_volume_status(&self, volume: &Volume) -> Result<Volume>;

    async fn commit_claim(&self, claim: &Claim) -> Result<Claim>;
    async fn commit_claim_status(&self, claim: &Claim) -> Result<Claim>;

    async fn delete_volume(&self, name: &str) -> Result<()>;

    /// Subscribe to Volume change notifications.
    fn watch_volumes(&self) -> BoxStream<'static, WatchEvent<Volume>>;

    /// Subscribe to Claim change notifications.
    fn watch_claims(&self) -> BoxStream<'static, WatchEvent<Claim>>;
}

// =============================================================================
// Matcher Port
// =============================================================================

/// Predicate deciding whether a Volume's descriptive attributes satisfy a
/// Claim's requirements. Candidate selection and priority rules live in the
/// binder; this trait carries only the attribute filter.
pub trait VolumeMatcher: Send + Sync {
    fn matches(&self, volume: &Volume, claim: &Claim) -> bool;
}

// =============================================================================
// Plugin Ports
// =============================================================================

/// Port for dynamic provisioning backends.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the storage asset for a claim and return a partially filled
    /// Volume: descriptive attributes only. The controller fills identity
    /// and the claim pointer before committing.
    async fn provision(&self, claim: &Claim) -> Result<Volume>;
}

/// Port for storage-asset deletion backends.
#[async_trait]
pub trait Deleter: Send + Sync {
    /// Remove the backing storage asset. The controller deletes the Volume
    /// object afterwards.
    async fn delete(&self, volume: &Volume) -> Result<()>;
}

/// Port for volume scrubbing backends.
#[async_trait]
pub trait Recycler: Send + Sync {
    /// Scrub the volume's contents and return when the scrubber worker has
    /// completed. Implementations derive the worker identity from the
    /// volume UID so a re-run adopts the existing worker.
    async fn recycle(&self, volume: &Volume) -> Result<()>;
}

// =============================================================================
// Event Recorder Port
// =============================================================================

/// Port for user-visible notices. Best-effort: loss of an event never
/// changes correctness, so recording is synchronous and infallible.
pub trait EventRecorder: Send + Sync {
    fn record(&self, reason: EventReason, object: &str, message: &str);

    /// Recorded events, for recorders that retain them. The default
    /// recorder forgets events as soon as they are emitted.
    fn events(&self) -> Vec<Event> {
        Vec::new()
    }
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ObjectStoreRef = Arc<dyn ObjectStore>;
pub type VolumeMatcherRef = Arc<dyn VolumeMatcher>;
pub type ProvisionerRef = Arc<dyn Provisioner>;
pub type DeleterRef = Arc<dyn Deleter>;
pub type RecyclerRef = Arc<dyn Recycler>;
pub type EventRecorderRef = Arc<dyn EventRecorder>;
