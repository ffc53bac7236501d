//! Resource definitions for the volume binder
//!
//! This module contains both resource kinds and the persisted object markers:
//! - Volume: a provisioned storage asset
//! - Claim: a request for storage
//!
//! Markers are plain annotations so that they survive round-trips through
//! any client that preserves metadata.

pub mod claim;
pub mod volume;

pub use claim::*;
pub use volume::*;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

// =============================================================================
// Object Markers
// =============================================================================

/// Applies to Claims. Present once the Claim has completed its initial
/// binding; changes how a null volume pointer is interpreted (fresh vs lost).
/// Never removed once set.
pub const ANN_BOUND_COMPLETED: &str = "volume.storage.billyronks.io/bound-completed";

/// Applies to Volumes and Claims. Present on exactly those endpoints whose
/// pointer was installed by the controller; absence marks a user pre-bind.
/// Governs whether the controller may later undo a broken binding.
pub const ANN_BOUND_BY_CONTROLLER: &str = "volume.storage.billyronks.io/bound-by-controller";

/// Applies to Claims. A non-empty value requests dynamic provisioning and
/// names the storage class to provision from.
pub const ANN_STORAGE_CLASS: &str = "volume.storage.billyronks.io/storage-class";

/// Legacy placeholder marker. Volumes carrying this annotation with a value
/// other than [`PROVISIONING_COMPLETED`] predate dynamic provisioning and are
/// swept on sight.
pub const ANN_PROVISIONING_REQUIRED: &str =
    "volume.storage.billyronks.io/provisioning-required";

/// Sentinel value marking a legacy placeholder as already provisioned.
pub const PROVISIONING_COMPLETED: &str =
    "volume.storage.billyronks.io/provisioning-completed";

/// Value stored for presence-only markers.
pub const ANN_VALUE_YES: &str = "yes";

// =============================================================================
// Annotation Helpers
// =============================================================================

/// Check whether an annotation key is present.
pub fn has_annotation(meta: &ObjectMeta, key: &str) -> bool {
    meta.annotations
        .as_ref()
        .map(|anns| anns.contains_key(key))
        .unwrap_or(false)
}

/// Fetch an annotation value.
pub fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|anns| anns.get(key))
        .map(String::as_str)
}

/// Set an annotation, creating the map if needed.
pub fn set_annotation(meta: &mut ObjectMeta, key: &str, value: &str) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

/// Remove an annotation if present.
pub fn clear_annotation(meta: &mut ObjectMeta, key: &str) {
    if let Some(anns) = meta.annotations.as_mut() {
        anns.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotation_roundtrip() {
        let mut meta = ObjectMeta::default();
        assert!(!has_annotation(&meta, ANN_BOUND_COMPLETED));

        set_annotation(&mut meta, ANN_BOUND_COMPLETED, ANN_VALUE_YES);
        assert!(has_annotation(&meta, ANN_BOUND_COMPLETED));
        assert_eq!(annotation(&meta, ANN_BOUND_COMPLETED), Some(ANN_VALUE_YES));

        clear_annotation(&mut meta, ANN_BOUND_COMPLETED);
        assert!(!has_annotation(&meta, ANN_BOUND_COMPLETED));
    }

    #[test]
    fn test_clear_on_empty_meta_is_noop() {
        let mut meta = ObjectMeta::default();
        clear_annotation(&mut meta, ANN_BOUND_BY_CONTROLLER);
        assert!(meta.annotations.is_none());
    }
}
