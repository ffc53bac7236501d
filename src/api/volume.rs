//! Volume resource
//!
//! A Volume is a provisioned storage asset. The controller owns only its
//! claim pointer, phase, and binding markers; descriptive attributes
//! (capacity, access modes, class, driver) belong to whoever provisioned it.

use crate::api::{has_annotation, ANN_BOUND_BY_CONTROLLER};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Volume CRD
// =============================================================================

/// Volume describes a provisioned storage asset that Claims can bind to.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1alpha1",
    kind = "Volume",
    plural = "volumes",
    shortname = "vol",
    status = "VolumeStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".spec.capacityBytes"}"#,
    printcolumn = r#"{"name": "Reclaim", "type": "string", "jsonPath": ".spec.reclaimPolicy"}"#,
    printcolumn = r#"{"name": "Claim", "type": "string", "jsonPath": ".spec.claimRef.name"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Usable capacity in bytes
    pub capacity_bytes: u64,

    /// Supported access modes
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,

    /// Storage class this volume belongs to
    #[serde(default)]
    pub class: Option<String>,

    /// Backend driver that owns the storage asset; used to resolve deleter
    /// and recycler plugins
    #[serde(default)]
    pub driver: Option<String>,

    /// Disposition of the volume after its claim disappears
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,

    /// Pointer to the bound (or reserved) claim
    #[serde(default)]
    pub claim_ref: Option<ClaimRef>,

    /// Driver-specific parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Reference from a Volume to a Claim.
///
/// A reference with a UID identifies a specific generation of the claim; a
/// reference without a UID is a reservation written by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRef {
    /// Name of the claim
    pub name: String,

    /// UID of the claim generation; absent for reservations
    #[serde(default)]
    pub uid: Option<String>,
}

impl ClaimRef {
    /// A reservation pointer: name only, no UID.
    pub fn reservation(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: None,
        }
    }

    /// A strong pointer to a specific claim generation.
    pub fn strong(name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: Some(uid.into()),
        }
    }
}

/// Access modes a volume supports or a claim requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::ReadWriteOnce => write!(f, "ReadWriteOnce"),
            AccessMode::ReadOnlyMany => write!(f, "ReadOnlyMany"),
            AccessMode::ReadWriteMany => write!(f, "ReadWriteMany"),
        }
    }
}

/// Disposition of a released volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ReclaimPolicy {
    /// Keep the volume object and asset around after release
    #[default]
    Retain,
    /// Remove the storage asset and the volume object
    Delete,
    /// Scrub the asset and return the volume to the pool
    Recycle,
}

impl std::fmt::Display for ReclaimPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReclaimPolicy::Retain => write!(f, "Retain"),
            ReclaimPolicy::Delete => write!(f, "Delete"),
            ReclaimPolicy::Recycle => write!(f, "Recycle"),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status of a Volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: VolumePhase,

    /// Human-readable detail for Failed volumes
    #[serde(default)]
    pub message: Option<String>,
}

/// Volume lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum VolumePhase {
    /// Unbound and usable by any claim
    #[default]
    Available,
    /// Bound to a claim
    Bound,
    /// Its claim is gone; awaiting reclaim
    Released,
    /// Reclamation failed or no plugin was configured
    Failed,
}

impl std::fmt::Display for VolumePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumePhase::Available => write!(f, "Available"),
            VolumePhase::Bound => write!(f, "Bound"),
            VolumePhase::Released => write!(f, "Released"),
            VolumePhase::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl Volume {
    /// Get the name of this volume
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    /// Get the UID of this volume
    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or("")
    }

    /// Get the current phase, defaulting when status has never been written
    pub fn phase(&self) -> VolumePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Set the phase, creating status if needed
    pub fn set_phase(&mut self, phase: VolumePhase) {
        self.status.get_or_insert_with(Default::default).phase = phase;
    }

    /// Record a failure message alongside the Failed phase
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.status.get_or_insert_with(Default::default).message = Some(message.into());
    }

    /// Whether the claim pointer was installed by the controller
    pub fn bound_by_controller(&self) -> bool {
        has_annotation(&self.metadata, ANN_BOUND_BY_CONTROLLER)
    }

    /// Whether the claim pointer is a reservation (name without UID)
    pub fn is_reserved(&self) -> bool {
        matches!(&self.spec.claim_ref, Some(r) if r.uid.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{set_annotation, ANN_VALUE_YES};

    fn volume(name: &str) -> Volume {
        Volume::new(
            name,
            VolumeSpec {
                capacity_bytes: 10 << 30,
                access_modes: vec![AccessMode::ReadWriteOnce],
                class: None,
                driver: Some("hostpath".into()),
                reclaim_policy: ReclaimPolicy::Retain,
                claim_ref: None,
                parameters: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn test_phase_defaults_available() {
        let v = volume("v1");
        assert_eq!(v.phase(), VolumePhase::Available);
    }

    #[test]
    fn test_set_phase_creates_status() {
        let mut v = volume("v1");
        v.set_phase(VolumePhase::Bound);
        assert_eq!(v.phase(), VolumePhase::Bound);
        assert_eq!(format!("{}", v.phase()), "Bound");
    }

    #[test]
    fn test_reservation_vs_strong_ref() {
        let mut v = volume("v1");
        v.spec.claim_ref = Some(ClaimRef::reservation("c1"));
        assert!(v.is_reserved());

        v.spec.claim_ref = Some(ClaimRef::strong("c1", "uid-1"));
        assert!(!v.is_reserved());
    }

    #[test]
    fn test_bound_by_controller_marker() {
        let mut v = volume("v1");
        assert!(!v.bound_by_controller());
        set_annotation(&mut v.metadata, ANN_BOUND_BY_CONTROLLER, ANN_VALUE_YES);
        assert!(v.bound_by_controller());
    }

    #[test]
    fn test_reclaim_policy_literals() {
        assert_eq!(format!("{}", ReclaimPolicy::Retain), "Retain");
        assert_eq!(format!("{}", ReclaimPolicy::Delete), "Delete");
        assert_eq!(format!("{}", ReclaimPolicy::Recycle), "Recycle");
    }
}
