//! Claim resource
//!
//! A Claim is a request for storage. The controller owns only its volume
//! pointer, phase, and binding markers.

use crate::api::{
    annotation, has_annotation, AccessMode, ANN_BOUND_BY_CONTROLLER, ANN_BOUND_COMPLETED,
    ANN_STORAGE_CLASS,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Claim CRD
// =============================================================================

/// Claim declares desired storage attributes and is bound to a Volume by the
/// controller (or pre-bound by the user from either side).
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1alpha1",
    kind = "Claim",
    plural = "claims",
    shortname = "clm",
    status = "ClaimStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Requested", "type": "integer", "jsonPath": ".spec.capacityBytes"}"#,
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.volumeName"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSpec {
    /// Minimum capacity required, in bytes
    pub capacity_bytes: u64,

    /// Access modes the claim requires
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,

    /// Name of the volume this claim is bound (or pre-bound) to
    #[serde(default)]
    pub volume_name: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of a Claim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: ClaimPhase,
}

/// Claim lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClaimPhase {
    /// Not yet bound
    #[default]
    Pending,
    /// Bound to a volume
    Bound,
    /// Previously bound, binding irrecoverably gone. Terminal.
    Lost,
}

impl std::fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimPhase::Pending => write!(f, "Pending"),
            ClaimPhase::Bound => write!(f, "Bound"),
            ClaimPhase::Lost => write!(f, "Lost"),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl Claim {
    /// Get the name of this claim
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    /// Get the UID of this claim
    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or("")
    }

    /// Get the current phase, defaulting when status has never been written
    pub fn phase(&self) -> ClaimPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Set the phase, creating status if needed
    pub fn set_phase(&mut self, phase: ClaimPhase) {
        self.status.get_or_insert_with(Default::default).phase = phase;
    }

    /// Whether this claim has ever completed a binding. Monotonic.
    pub fn was_ever_bound(&self) -> bool {
        has_annotation(&self.metadata, ANN_BOUND_COMPLETED)
    }

    /// Whether the volume pointer was installed by the controller
    pub fn bound_by_controller(&self) -> bool {
        has_annotation(&self.metadata, ANN_BOUND_BY_CONTROLLER)
    }

    /// The storage class requested for dynamic provisioning, if any
    pub fn storage_class(&self) -> Option<&str> {
        annotation(&self.metadata, ANN_STORAGE_CLASS).filter(|v| !v.is_empty())
    }
}
