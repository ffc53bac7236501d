//! Reclaim and Provisioning Plugins
//!
//! The registry resolves backend plugins for a given object:
//! - provisioners by storage-class name (dynamic provisioning)
//! - deleters and recyclers by the volume's backend driver
//!
//! Resolution failure is a user-visible configuration condition, surfaced
//! through events and the Failed phase, never a crash.

use crate::api::{Claim, Volume};
use crate::domain::ports::{DeleterRef, ProvisionerRef, RecyclerRef};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::info;

/// Deterministic identity for the scrubber worker recycling a volume, so a
/// relaunched job adopts the existing worker instead of duplicating it.
pub fn scrubber_worker_name(volume_uid: &str) -> String {
    format!("recycler-{volume_uid}")
}

// =============================================================================
// Plugin Registry
// =============================================================================

/// Registry of reclaim and provisioning backends
#[derive(Default)]
pub struct PluginRegistry {
    /// Provisioners by storage-class name
    provisioners: RwLock<BTreeMap<String, ProvisionerRef>>,
    /// Deleters by driver name
    deleters: RwLock<BTreeMap<String, DeleterRef>>,
    /// Recyclers by driver name
    recyclers: RwLock<BTreeMap<String, RecyclerRef>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_provisioner(&self, class: impl Into<String>, plugin: ProvisionerRef) {
        let class = class.into();
        info!(%class, "registering provisioner");
        self.provisioners.write().insert(class, plugin);
    }

    pub fn register_deleter(&self, driver: impl Into<String>, plugin: DeleterRef) {
        let driver = driver.into();
        info!(%driver, "registering deleter");
        self.deleters.write().insert(driver, plugin);
    }

    pub fn register_recycler(&self, driver: impl Into<String>, plugin: RecyclerRef) {
        let driver = driver.into();
        info!(%driver, "registering recycler");
        self.recyclers.write().insert(driver, plugin);
    }

    /// Resolve the provisioner for a claim's requested storage class.
    pub fn provisioner_for(&self, claim: &Claim) -> Option<ProvisionerRef> {
        let class = claim.storage_class()?;
        self.provisioners.read().get(class).cloned()
    }

    /// Resolve the deleter for a volume's backend driver.
    pub fn deleter_for(&self, volume: &Volume) -> Option<DeleterRef> {
        let driver = volume.spec.driver.as_deref()?;
        self.deleters.read().get(driver).cloned()
    }

    /// Resolve the recycler for a volume's backend driver.
    pub fn recycler_for(&self, volume: &Volume) -> Option<RecyclerRef> {
        let driver = volume.spec.driver.as_deref()?;
        self.recyclers.read().get(driver).cloned()
    }
}
