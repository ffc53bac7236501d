//! Volume↔Claim binding
//!
//! The binder keeps two independently-mutable resources, Volumes and
//! Claims, in consistent bidirectional bindings over a store that offers
//! only per-object optimistic writes. Each side of a binding carries a
//! pointer to the other by name; a pointer with a UID identifies a specific
//! generation of the peer, a pointer without one is a reservation. The
//! `bound-by-controller` marker distinguishes links the controller installed
//! (and may withdraw) from links a user declared (which it must respect);
//! without that distinction, racing controller instances could produce
//! indistinguishable duplicate bindings.
//!
//! Reconciliation is a single pass: read current state, take one legal step,
//! commit at most two single-object writes, and return on any failure.
//! Consistency comes from invariants and re-runs, not ordering; every pass
//! must be safe to repeat, to interleave with other objects' passes, and to
//! die at any commit boundary.

pub mod claim_sync;
pub mod controller;
pub mod legacy;
pub mod matcher;
pub mod volume_sync;

#[cfg(test)]
pub(crate) mod testutil;

pub use controller::{Controller, ControllerConfig};
pub use matcher::{find_acceptable_volume, RequirementsMatcher};

use crate::api::{Claim, ClaimPhase, Volume, VolumePhase};
use crate::domain::ports::{
    EventRecorder, EventRecorderRef, ObjectStore, ObjectStoreRef, VolumeMatcherRef,
};
use crate::error::Result;
use crate::events::EventReason;
use crate::plugins::PluginRegistry;
use crate::work::WorkRegistry;
use std::sync::Arc;

/// Name given to a dynamically provisioned volume. Deterministic in the
/// claim UID so a crashed provisioning job converges by colliding with its
/// own earlier create.
pub fn provisioned_volume_name(claim_uid: &str) -> String {
    format!("vol-{claim_uid}")
}

pub(crate) fn volume_label(volume: &Volume) -> String {
    format!("Volume/{}", volume.name())
}

pub(crate) fn claim_label(claim: &Claim) -> String {
    format!("Claim/{}", claim.name())
}

// =============================================================================
// Binder
// =============================================================================

/// The reconciliation core: one state machine per resource kind, plus the
/// detached side-effect jobs they launch.
pub struct Binder {
    store: ObjectStoreRef,
    plugins: Arc<PluginRegistry>,
    work: Arc<WorkRegistry>,
    events: EventRecorderRef,
    matcher: VolumeMatcherRef,
}

impl Binder {
    pub fn new(
        store: ObjectStoreRef,
        plugins: Arc<PluginRegistry>,
        work: Arc<WorkRegistry>,
        events: EventRecorderRef,
        matcher: VolumeMatcherRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            plugins,
            work,
            events,
            matcher,
        })
    }

    /// Mark a claim terminally lost.
    pub(crate) async fn mark_claim_lost(&self, claim: &Claim, why: &str) -> Result<()> {
        let mut claim = claim.clone();
        claim.set_phase(ClaimPhase::Lost);
        self.store.commit_claim_status(&claim).await?;
        self.events
            .record(EventReason::ClaimLost, &claim_label(&claim), why);
        Ok(())
    }

    /// Mark a volume failed with a message. Idempotent: re-marking an
    /// already-failed volume with the same message commits nothing.
    pub(crate) async fn mark_volume_failed(&self, volume: &Volume, why: &str) -> Result<()> {
        let already = volume.phase() == VolumePhase::Failed
            && volume.status.as_ref().and_then(|s| s.message.as_deref()) == Some(why);
        if already {
            return Ok(());
        }
        let mut volume = volume.clone();
        volume.set_phase(VolumePhase::Failed);
        volume.set_message(why);
        self.store.commit_volume_status(&volume).await?;
        Ok(())
    }
}
