//! Volume Binder
//!
//! A controller that binds two independently-created declarative resources,
//! Volumes (provisioned storage assets) and Claims (requests for storage),
//! into consistent bidirectional bindings over a transactionless store, and
//! drives reclamation (retain / delete / recycle) and dynamic provisioning
//! through pluggable backends.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Control Loop                          │
//! │   watch dispatch · 15s full resync · per-object serialization│
//! ├──────────────────────────┬───────────────────────────────────┤
//! │     Claim reconciler     │        Volume reconciler          │
//! │  match · bind · provision│  release · reclaim dispatch       │
//! ├──────────────────────────┴───────────────────────────────────┤
//! │  Matcher │ Plugin registry │ Work registry │ Event recorder  │
//! ├──────────────────────────────────────────────────────────────┤
//! │                    Object store adapter                      │
//! │        (Kubernetes API server  |  in-memory standalone)      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`api`]: Volume and Claim resource definitions and object markers
//! - [`binder`]: reconcilers, matcher, legacy sweep, control loop
//! - [`domain`]: port traits for stores, plugins, matcher, events
//! - [`error`]: error taxonomy and handling
//! - [`events`]: user-visible event reasons and recorders
//! - [`plugins`]: provisioner/deleter/recycler registry
//! - [`store`]: object store adapters
//! - [`work`]: in-flight job registry and per-object locks

pub mod api;
pub mod binder;
pub mod domain;
pub mod error;
pub mod events;
pub mod plugins;
pub mod store;
pub mod work;

// Re-export commonly used types
pub use api::{
    AccessMode, Claim, ClaimPhase, ClaimRef, ClaimSpec, ClaimStatus, ReclaimPolicy, Volume,
    VolumePhase, VolumeSpec, VolumeStatus,
};

pub use binder::{
    find_acceptable_volume, provisioned_volume_name, Binder, Controller, ControllerConfig,
    RequirementsMatcher,
};

pub use domain::ports::{
    Deleter, DeleterRef, EventRecorder, EventRecorderRef, ObjectStore, ObjectStoreRef,
    Provisioner, ProvisionerRef, Recycler, RecyclerRef, VolumeMatcher, VolumeMatcherRef,
    WatchEvent,
};

pub use error::{Error, Result};

pub use events::{Event, EventReason, LogRecorder, MemoryRecorder};

pub use plugins::{scrubber_worker_name, PluginRegistry};

pub use store::{KubeStore, MemoryStore};

pub use work::{KeyedLocks, WorkRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
