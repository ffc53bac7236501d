//! Volume selection for claims
//!
//! The attribute predicate is pluggable ([`VolumeMatcher`]); the priority
//! and smallest-sufficient rules here are not. A volume already pointing at
//! the claim always wins, honoring user pre-binds from the volume side.

use crate::api::{Claim, Volume};
use crate::binder::legacy::is_placeholder_volume;
use crate::domain::ports::VolumeMatcher;

/// Default attribute predicate: capacity sufficiency, access-mode coverage,
/// class equality.
#[derive(Debug, Default)]
pub struct RequirementsMatcher;

impl VolumeMatcher for RequirementsMatcher {
    fn matches(&self, volume: &Volume, claim: &Claim) -> bool {
        if volume.spec.capacity_bytes < claim.spec.capacity_bytes {
            return false;
        }
        if !claim
            .spec
            .access_modes
            .iter()
            .all(|mode| volume.spec.access_modes.contains(mode))
        {
            return false;
        }
        volume.spec.class.as_deref() == claim.storage_class()
    }
}

/// Select an acceptable volume for a claim.
///
/// Pre-bound volumes (claim pointer naming this claim, UID absent or equal)
/// take top priority; otherwise the smallest sufficient unclaimed volume
/// wins. Ties break deterministically by volume name. Legacy placeholder
/// volumes are never candidates.
pub fn find_acceptable_volume<'a>(
    claim: &Claim,
    volumes: &'a [Volume],
    matcher: &dyn VolumeMatcher,
) -> Option<&'a Volume> {
    let pre_bound = volumes
        .iter()
        .filter(|v| !is_placeholder_volume(v))
        .filter(|v| match &v.spec.claim_ref {
            Some(r) => {
                r.name == claim.name()
                    && (r.uid.is_none() || r.uid.as_deref() == Some(claim.uid()))
            }
            None => false,
        })
        .min_by(|a, b| a.name().cmp(b.name()));
    if pre_bound.is_some() {
        return pre_bound;
    }

    volumes
        .iter()
        .filter(|v| !is_placeholder_volume(v))
        .filter(|v| v.spec.claim_ref.is_none())
        .filter(|v| matcher.matches(v, claim))
        .min_by(|a, b| {
            a.spec
                .capacity_bytes
                .cmp(&b.spec.capacity_bytes)
                .then_with(|| a.name().cmp(b.name()))
        })
}
