//! Volume reconciliation
//!
//! One pass over a single Volume snapshot, including release of volumes
//! whose claim is gone and dispatch of the reclaim policy. Delete and
//! recycle run as detached jobs registered with the work registry; the pass
//! itself stays cheap and returns early on any failure.

use super::{volume_label, Binder};
use crate::api::{
    clear_annotation, ReclaimPolicy, Volume, VolumePhase, ANN_BOUND_BY_CONTROLLER,
};
use crate::binder::legacy;
use crate::domain::ports::{DeleterRef, EventRecorder, ObjectStore, RecyclerRef};
use crate::error::Result;
use crate::events::EventReason;
use tracing::{debug, info, warn};

impl Binder {
    /// Reconcile a single volume.
    pub async fn sync_volume(&self, volume: &Volume) -> Result<()> {
        if legacy::sweep_placeholder(self.store.as_ref(), volume).await? {
            return Ok(());
        }

        let Some(claim_ref) = volume.spec.claim_ref.clone() else {
            // Unused volume.
            if volume.phase() != VolumePhase::Available {
                let mut volume = volume.clone();
                volume.set_phase(VolumePhase::Available);
                self.store.commit_volume_status(&volume).await?;
            }
            return Ok(());
        };

        let Some(ref_uid) = claim_ref.uid.clone() else {
            // Reserved for a claim that has not bound yet; the claim pass
            // completes or abandons it.
            return Ok(());
        };

        // Fetch by name; a recycled name is a different claim entirely.
        let claim = self
            .store
            .get_claim(&claim_ref.name)
            .await?
            .filter(|c| c.uid() == ref_uid);

        let Some(claim) = claim else {
            // The bound claim is gone.
            return self.release_volume(volume).await;
        };

        match claim.spec.volume_name.as_deref() {
            None => {
                // The claim side has not finished binding; the claim pass
                // either completes it or abandons the volume.
                Ok(())
            }
            Some(name) if name == volume.name() => {
                // Properly bound.
                if volume.phase() != VolumePhase::Bound {
                    let mut volume = volume.clone();
                    volume.set_phase(VolumePhase::Bound);
                    self.store.commit_volume_status(&volume).await?;
                }
                Ok(())
            }
            Some(_) => {
                if volume.bound_by_controller() {
                    // Our provisional link lost the race for this claim;
                    // withdraw it.
                    let mut volume = volume.clone();
                    volume.spec.claim_ref = None;
                    clear_annotation(&mut volume.metadata, ANN_BOUND_BY_CONTROLLER);
                    let mut volume = self.store.commit_volume(&volume).await?;
                    volume.set_phase(VolumePhase::Available);
                    self.store.commit_volume_status(&volume).await?;
                    info!(volume = volume.name(), "withdrew losing binding");
                    Ok(())
                } else {
                    // The user created the volume with this pointer; leave
                    // it, but the binding has not completed and may never.
                    if volume.phase() != VolumePhase::Available {
                        let mut volume = volume.clone();
                        volume.set_phase(VolumePhase::Available);
                        self.store.commit_volume_status(&volume).await?;
                    }
                    Ok(())
                }
            }
        }
    }

    /// The bound claim is gone: commit Released first, then dispatch the
    /// reclaim policy, so that a crash in between lands on a Released
    /// volume whose next pass re-dispatches.
    async fn release_volume(&self, volume: &Volume) -> Result<()> {
        let mut volume = volume.clone();
        if !matches!(volume.phase(), VolumePhase::Released | VolumePhase::Failed) {
            volume.set_phase(VolumePhase::Released);
            volume = self.store.commit_volume_status(&volume).await?;
            self.events.record(
                EventReason::VolumeReleased,
                &volume_label(&volume),
                "bound claim is gone",
            );
        }

        match volume.spec.reclaim_policy {
            ReclaimPolicy::Retain => Ok(()),
            ReclaimPolicy::Delete => match self.plugins.deleter_for(&volume) {
                Some(deleter) => {
                    self.spawn_delete(volume, deleter);
                    Ok(())
                }
                None => {
                    self.events.record(
                        EventReason::NoDeleter,
                        &volume_label(&volume),
                        &format!("no deleter configured for driver {:?}", volume.spec.driver),
                    );
                    self.mark_volume_failed(&volume, "no deleter plugin configured")
                        .await
                }
            },
            ReclaimPolicy::Recycle => match self.plugins.recycler_for(&volume) {
                Some(recycler) => {
                    self.spawn_recycle(volume, recycler);
                    Ok(())
                }
                None => {
                    self.events.record(
                        EventReason::NoRecycler,
                        &volume_label(&volume),
                        &format!("no recycler configured for driver {:?}", volume.spec.driver),
                    );
                    self.mark_volume_failed(&volume, "no recycler plugin configured")
                        .await
                }
            },
        }
    }

    /// Detached delete job, at most one per volume UID: remove the backing
    /// asset, then the volume object.
    fn spawn_delete(&self, volume: Volume, deleter: DeleterRef) {
        let store = self.store.clone();
        let events = self.events.clone();
        let name = volume.name().to_string();
        self.work.start_unique(volume.uid().to_string(), async move {
            // The snapshot that scheduled this job may be stale; a finished
            // earlier job leaves nothing to do.
            let fresh = match store.get_volume(&name).await {
                Ok(Some(v)) => v,
                Ok(None) => return,
                Err(err) => {
                    debug!(volume = %name, error = %err, "skipping delete, cannot read volume");
                    return;
                }
            };
            if !matches!(fresh.phase(), VolumePhase::Released | VolumePhase::Failed)
                || fresh.spec.claim_ref.is_none()
            {
                return;
            }

            let label = volume_label(&fresh);
            if let Err(err) = deleter.delete(&fresh).await {
                events.record(EventReason::DeleteFailed, &label, &err.to_string());
                let mut failed = fresh;
                failed.set_phase(VolumePhase::Failed);
                failed.set_message(format!("deleter failed: {err}"));
                if let Err(err) = store.commit_volume_status(&failed).await {
                    debug!(volume = failed.name(), error = %err, "could not record failure");
                }
                return;
            }
            match store.delete_volume(&name).await {
                Ok(()) => info!(volume = %name, "reclaimed volume deleted"),
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    // The asset is gone; the object delete retries on the
                    // next pass.
                    warn!(volume = %name, error = %err, "deleting volume object failed");
                }
            }
        });
    }

    /// Detached recycle job, at most one per volume UID. The recycler's
    /// scrubber worker identity derives from the volume UID, so a re-run
    /// after a crash adopts the in-flight worker instead of duplicating it.
    fn spawn_recycle(&self, volume: Volume, recycler: RecyclerRef) {
        let store = self.store.clone();
        let events = self.events.clone();
        let name = volume.name().to_string();
        self.work.start_unique(volume.uid().to_string(), async move {
            // The volume may have moved on since the job was scheduled.
            let fresh = match store.get_volume(&name).await {
                Ok(Some(v)) => v,
                Ok(None) => return,
                Err(err) => {
                    debug!(volume = %name, error = %err, "skipping recycle, cannot read volume");
                    return;
                }
            };
            if !matches!(fresh.phase(), VolumePhase::Released | VolumePhase::Failed)
                || fresh.spec.claim_ref.is_none()
            {
                return;
            }

            if let Err(err) = recycler.recycle(&fresh).await {
                events.record(EventReason::RecycleFailed, &volume_label(&fresh), &err.to_string());
                let mut failed = fresh;
                failed.set_phase(VolumePhase::Failed);
                failed.set_message(format!("recycler failed: {err}"));
                if let Err(err) = store.commit_volume_status(&failed).await {
                    debug!(volume = failed.name(), error = %err, "could not record failure");
                }
                return;
            }

            // The scrub wait was long; start from fresh state again.
            let mut scrubbed = match store.get_volume(&name).await {
                Ok(Some(v)) => v,
                Ok(None) => return,
                Err(err) => {
                    debug!(volume = %name, error = %err, "recycle follow-up read failed; next pass retries");
                    return;
                }
            };
            if let Some(claim_ref) = scrubbed.spec.claim_ref.as_mut() {
                claim_ref.uid = None;
            }
            if scrubbed.bound_by_controller() {
                scrubbed.spec.claim_ref = None;
                clear_annotation(&mut scrubbed.metadata, ANN_BOUND_BY_CONTROLLER);
            }
            let mut scrubbed = match store.commit_volume(&scrubbed).await {
                Ok(v) => v,
                Err(err) => {
                    debug!(volume = %name, error = %err, "recycle commit lost; next pass retries");
                    return;
                }
            };
            scrubbed.set_phase(VolumePhase::Available);
            match store.commit_volume_status(&scrubbed).await {
                Ok(_) => info!(volume = %name, "recycled volume back in the pool"),
                Err(err) => {
                    debug!(volume = %name, error = %err, "recycle status commit lost; next pass retries");
                }
            }
        });
    }
}
