//! Shared fixtures for binder tests

use crate::api::{AccessMode, Claim, ClaimSpec, ReclaimPolicy, Volume, VolumeSpec};
use crate::binder::{Binder, RequirementsMatcher};
use crate::domain::ports::{Deleter, ObjectStore, Provisioner, Recycler};
use crate::error::{Error, Result};
use crate::events::MemoryRecorder;
use crate::plugins::{scrubber_worker_name, PluginRegistry};
use crate::store::MemoryStore;
use crate::work::WorkRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) const TEST_DRIVER: &str = "hostpath";

pub(crate) fn test_volume(name: &str, capacity: u64) -> Volume {
    Volume::new(
        name,
        VolumeSpec {
            capacity_bytes: capacity,
            access_modes: vec![AccessMode::ReadWriteOnce],
            class: None,
            driver: Some(TEST_DRIVER.into()),
            reclaim_policy: ReclaimPolicy::Retain,
            claim_ref: None,
            parameters: Default::default(),
        },
    )
}

pub(crate) fn test_claim(name: &str, capacity: u64) -> Claim {
    Claim::new(
        name,
        ClaimSpec {
            capacity_bytes: capacity,
            access_modes: vec![AccessMode::ReadWriteOnce],
            volume_name: None,
        },
    )
}

// =============================================================================
// Plugin Doubles
// =============================================================================

/// Provisioner returning a fixed-size volume spec, counting invocations.
pub(crate) struct StaticProvisioner {
    pub capacity_bytes: u64,
    pub class: String,
    pub calls: AtomicUsize,
}

impl StaticProvisioner {
    pub fn new(class: &str, capacity_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity_bytes,
            class: class.to_string(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Provisioner for StaticProvisioner {
    async fn provision(&self, _claim: &Claim) -> Result<Volume> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut volume = test_volume("", self.capacity_bytes);
        volume.metadata.name = None;
        volume.spec.class = Some(self.class.clone());
        volume.spec.reclaim_policy = ReclaimPolicy::Delete;
        Ok(volume)
    }
}

/// Deleter recording which assets it removed; optionally failing.
#[derive(Default)]
pub(crate) struct RecordingDeleter {
    pub deleted: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl RecordingDeleter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Deleter for RecordingDeleter {
    async fn delete(&self, volume: &Volume) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Transient("asset removal failed".into()));
        }
        self.deleted.lock().push(volume.name().to_string());
        Ok(())
    }
}

/// Recycler recording the deterministic worker identities it launched.
#[derive(Default)]
pub(crate) struct RecordingRecycler {
    pub workers: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl RecordingRecycler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Recycler for RecordingRecycler {
    async fn recycle(&self, volume: &Volume) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Transient("scrubber worker failed".into()));
        }
        self.workers.lock().push(scrubber_worker_name(volume.uid()));
        Ok(())
    }
}

// =============================================================================
// Fixture
// =============================================================================

/// A binder wired to an in-memory store with recording collaborators.
pub(crate) struct Fixture {
    pub store: Arc<MemoryStore>,
    pub plugins: Arc<PluginRegistry>,
    pub work: Arc<WorkRegistry>,
    pub events: Arc<MemoryRecorder>,
    pub binder: Arc<Binder>,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let plugins = Arc::new(PluginRegistry::new());
        let work = WorkRegistry::new();
        let events = Arc::new(MemoryRecorder::new());
        let binder = Binder::new(
            store.clone(),
            plugins.clone(),
            work.clone(),
            events.clone(),
            Arc::new(RequirementsMatcher),
        );
        Self {
            store,
            plugins,
            work,
            events,
            binder,
        }
    }

    pub async fn volume(&self, name: &str) -> Volume {
        self.store.get_volume(name).await.unwrap().unwrap()
    }

    pub async fn claim(&self, name: &str) -> Claim {
        self.store.get_claim(name).await.unwrap().unwrap()
    }
}
