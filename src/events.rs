//! Binder Events
//!
//! User-visible notices emitted by the reconcilers. Events are best-effort
//! observability; losing one never changes correctness.

use crate::domain::ports::EventRecorder;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

// =============================================================================
// Event Reasons
// =============================================================================

/// Named user-visible conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventReason {
    /// A claim requested a storage class with no provisioner configured
    NoProvisioner,
    /// A released volume has reclaim policy Delete but no deleter configured
    NoDeleter,
    /// A released volume has reclaim policy Recycle but no recycler configured
    NoRecycler,
    /// A half-broken bidirectional link was re-established
    BindingFixed,
    /// The controller observed a state it could never have written
    ImpossibleState,
    /// A claim's binding is irrecoverably gone
    ClaimLost,
    /// A volume's claim disappeared and the volume was released
    VolumeReleased,
    /// A provisioning job failed; the claim stays Pending
    ProvisionFailed,
    /// A deletion job failed; the volume is marked Failed
    DeleteFailed,
    /// A recycling job failed; the volume is marked Failed
    RecycleFailed,
}

impl std::fmt::Display for EventReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventReason::NoProvisioner => write!(f, "NoProvisioner"),
            EventReason::NoDeleter => write!(f, "NoDeleter"),
            EventReason::NoRecycler => write!(f, "NoRecycler"),
            EventReason::BindingFixed => write!(f, "BindingFixed"),
            EventReason::ImpossibleState => write!(f, "ImpossibleState"),
            EventReason::ClaimLost => write!(f, "ClaimLost"),
            EventReason::VolumeReleased => write!(f, "VolumeReleased"),
            EventReason::ProvisionFailed => write!(f, "ProvisionFailed"),
            EventReason::DeleteFailed => write!(f, "DeleteFailed"),
            EventReason::RecycleFailed => write!(f, "RecycleFailed"),
        }
    }
}

impl EventReason {
    /// Whether the condition warrants operator attention rather than being
    /// part of normal churn.
    pub fn is_warning(&self) -> bool {
        !matches!(
            self,
            EventReason::BindingFixed | EventReason::VolumeReleased
        )
    }
}

// =============================================================================
// Event Record
// =============================================================================

/// A recorded event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub reason: EventReason,
    /// Object the event is about, as "Kind/name"
    pub object: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Recorders
// =============================================================================

/// Recorder that forwards events to the log
#[derive(Debug, Default)]
pub struct LogRecorder;

impl EventRecorder for LogRecorder {
    fn record(&self, reason: EventReason, object: &str, message: &str) {
        match reason {
            EventReason::ImpossibleState => {
                error!(%reason, object, "{}", message)
            }
            r if r.is_warning() => warn!(%reason, object, "{}", message),
            _ => info!(%reason, object, "{}", message),
        }
    }
}

/// Recorder that retains events in memory; used by tests and standalone
/// introspection
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count recorded events with the given reason
    pub fn count(&self, reason: EventReason) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.reason == reason)
            .count()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, reason: EventReason, object: &str, message: &str) {
        self.events.lock().push(Event {
            reason,
            object: object.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_recorder_retains() {
        let rec = MemoryRecorder::new();
        rec.record(EventReason::NoDeleter, "Volume/v1", "no deleter for driver nfs");
        rec.record(EventReason::ClaimLost, "Claim/c1", "bound volume is gone");
        rec.record(EventReason::ClaimLost, "Claim/c2", "bound volume is gone");

        assert_eq!(rec.events().len(), 3);
        assert_eq!(rec.count(EventReason::ClaimLost), 2);
        assert_eq!(rec.count(EventReason::NoRecycler), 0);
        assert_eq!(rec.events()[0].object, "Volume/v1");
    }

    #[test]
    fn test_reason_severity() {
        assert!(EventReason::ImpossibleState.is_warning());
        assert!(EventReason::NoProvisioner.is_warning());
        assert!(!EventReason::VolumeReleased.is_warning());
        assert!(!EventReason::BindingFixed.is_warning());
    }

    #[test]
    fn test_reason_literals() {
        assert_eq!(format!("{}", EventReason::NoProvisioner), "NoProvisioner");
        assert_eq!(format!("{}", EventReason::BindingFixed), "BindingFixed");
    }
}
