//! Control loop
//!
//! Watch dispatch, periodic full resync, and cross-touches on deletes.
//! Event handlers enqueue work as detached tasks; reconciliations for the
//! same object are serialized by a per-identity lock, different objects run
//! in parallel. No cross-object ordering is enforced anywhere; consistency
//! comes from the reconcilers' invariants and re-runs.

use super::Binder;
use crate::api::{Claim, Volume};
use crate::domain::ports::{ObjectStore, ObjectStoreRef, WatchEvent};
use crate::error::Result;
use crate::work::{KeyedLocks, WorkRegistry};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the control loop
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Interval of the full resync pass. Watches keep us current; the
    /// resync backstops missed and coalesced deliveries.
    pub resync_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(15),
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Drives the binder from watch events and the periodic resync tick.
pub struct Controller {
    config: ControllerConfig,
    store: ObjectStoreRef,
    binder: Arc<Binder>,
    work: Arc<WorkRegistry>,
    locks: KeyedLocks,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        store: ObjectStoreRef,
        binder: Arc<Binder>,
        work: Arc<WorkRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            binder,
            work,
            locks: KeyedLocks::new(),
        })
    }

    /// Run until the shutdown signal fires. Subscribes to both watch
    /// streams before the bootstrap resync so no change slips between them.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut volume_events = self.store.watch_volumes();
        let mut claim_events = self.store.watch_claims();

        // Resync everything up front; we trust nothing that happened while
        // we were not running.
        self.resync_all().await;
        info!(interval = ?self.config.resync_interval, "controller started");

        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.resync_interval,
            self.config.resync_interval,
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("controller shutting down");
                    self.work.abort_all();
                    return Ok(());
                }
                _ = tick.tick() => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.resync_all().await });
                }
                Some(event) = volume_events.next() => Arc::clone(&self).dispatch_volume_event(event),
                Some(event) = claim_events.next() => Arc::clone(&self).dispatch_claim_event(event),
                else => {
                    warn!("watch streams closed; controller stopping");
                    return Ok(());
                }
            }
        }
    }

    fn dispatch_claim_event(self: Arc<Self>, event: WatchEvent<Claim>) {
        tokio::spawn(async move {
            match event {
                WatchEvent::Created(claim) | WatchEvent::Modified(claim) => {
                    self.reconcile_claim(claim.name()).await;
                }
                WatchEvent::Deleted(claim) => {
                    // The claim is usually gone by now; the volume it was
                    // bound to has to notice and enter Released.
                    self.reconcile_claim(claim.name()).await;
                    if let Some(volume) = claim.spec.volume_name.as_deref() {
                        self.reconcile_volume(volume).await;
                    }
                }
            }
        });
    }

    fn dispatch_volume_event(self: Arc<Self>, event: WatchEvent<Volume>) {
        tokio::spawn(async move {
            match event {
                WatchEvent::Modified(volume) => {
                    self.reconcile_volume(volume.name()).await;
                }
                WatchEvent::Created(volume) | WatchEvent::Deleted(volume) => {
                    // A new volume can unblock pending claims; a deleted one
                    // can lose bound ones.
                    self.reconcile_volume(volume.name()).await;
                    self.resync_claims().await;
                }
            }
        });
    }

    /// Reconcile one claim from fresh state, serialized per identity.
    pub async fn reconcile_claim(&self, name: &str) {
        let lock = self.locks.lock_for(&format!("claim/{name}"));
        let _guard = lock.lock().await;
        let claim = match self.store.get_claim(name).await {
            Ok(Some(claim)) => claim,
            Ok(None) => return,
            Err(err) => {
                warn!(claim = name, error = %err, "cannot read claim");
                return;
            }
        };
        if let Err(err) = self.binder.sync_claim(&claim).await {
            if err.is_conflict() {
                debug!(claim = name, "claim pass lost a write race; will retry");
            } else {
                warn!(claim = name, error = %err, "claim pass failed; will retry");
            }
        }
    }

    /// Reconcile one volume from fresh state, serialized per identity.
    pub async fn reconcile_volume(&self, name: &str) {
        let lock = self.locks.lock_for(&format!("volume/{name}"));
        let _guard = lock.lock().await;
        let volume = match self.store.get_volume(name).await {
            Ok(Some(volume)) => volume,
            Ok(None) => return,
            Err(err) => {
                warn!(volume = name, error = %err, "cannot read volume");
                return;
            }
        };
        if let Err(err) = self.binder.sync_volume(&volume).await {
            if err.is_conflict() {
                debug!(volume = name, "volume pass lost a write race; will retry");
            } else {
                warn!(volume = name, error = %err, "volume pass failed; will retry");
            }
        }
    }

    /// Full resync: every volume, then every claim.
    pub async fn resync_all(&self) {
        self.resync_volumes().await;
        self.resync_claims().await;
    }

    async fn resync_volumes(&self) {
        match self.store.list_volumes().await {
            Ok(volumes) => {
                for volume in volumes {
                    self.reconcile_volume(volume.name()).await;
                }
            }
            Err(err) => warn!(error = %err, "volume resync listing failed"),
        }
    }

    async fn resync_claims(&self) {
        match self.store.list_claims().await {
            Ok(claims) => {
                for claim in claims {
                    self.reconcile_claim(claim.name()).await;
                }
            }
            Err(err) => warn!(error = %err, "claim resync listing failed"),
        }
    }
}
