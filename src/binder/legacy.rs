//! Legacy placeholder sweep
//!
//! Early releases pre-created placeholder Volumes ahead of provisioning.
//! Those objects carry the provisioning-required marker and must be deleted
//! on sight so the current provisioning path re-creates proper Volumes.
//! The whole module goes away once no store can contain such objects.

use crate::api::{annotation, Volume, ANN_PROVISIONING_REQUIRED, PROVISIONING_COMPLETED};
use crate::domain::ports::ObjectStore;
use crate::error::Result;
use tracing::info;

/// Whether a volume is a legacy placeholder: the provisioning-required
/// marker is present with any value other than the completed sentinel.
pub fn is_placeholder_volume(volume: &Volume) -> bool {
    match annotation(&volume.metadata, ANN_PROVISIONING_REQUIRED) {
        Some(value) => value != PROVISIONING_COMPLETED,
        None => false,
    }
}

/// Delete a placeholder volume outright. Returns whether the volume was a
/// placeholder that is now gone, so callers can short-circuit the rest of
/// their pass; a failed delete propagates and the next pass retries.
pub async fn sweep_placeholder(store: &dyn ObjectStore, volume: &Volume) -> Result<bool> {
    if !is_placeholder_volume(volume) {
        return Ok(false);
    }
    match store.delete_volume(volume.name()).await {
        Ok(()) => {
            info!(volume = volume.name(), "deleted legacy placeholder volume");
            Ok(true)
        }
        Err(err) if err.is_not_found() => Ok(true),
        Err(err) => Err(err),
    }
}
