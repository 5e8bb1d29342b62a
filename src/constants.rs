//! # System Constants
//!
//! Label keys, metric label names and other fixed strings shared between the
//! controller, the declarative store records and the telemetry backend.

/// Cluster label keys carried by every managed object
pub mod labels {
    pub const APP_ID: &str = "dtm/id";
    pub const DIGITAL_TWIN: &str = "dtm/digitaltwin";
    pub const AFFINITY: &str = "dtm/affinity";
}

/// Label names on the lifecycle-state telemetry samples
pub mod metric_labels {
    pub const TWIN_ID: &str = "dtm_id";
    pub const DIGITAL_TWIN: &str = "dtm_digitaltwin";
    pub const AFFINITY: &str = "dtm_affinity";
}

/// Metric queried when no override is configured
pub const DEFAULT_LIFECYCLE_METRIC: &str = "dt_life_cycle_state";

/// Key prefix of app records when no override is configured
pub const DEFAULT_KEY_PREFIX: &str = "/apps";

/// Digital twin lifecycle state as reported by telemetry.
///
/// The integer codes are fixed by the twins that export the metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Twin started, not yet ready
    Pending,
    /// Not bound to a physical counterpart yet
    Unbound,
    /// Bound but not entangled yet
    BoundNotEntangled,
    /// Binding lost at the current zone
    EntanglementBroken,
    /// Bound and entangled
    Entangled,
}

impl LifecycleState {
    pub fn code(self) -> i64 {
        match self {
            LifecycleState::Pending => 1,
            LifecycleState::Unbound => 2,
            LifecycleState::BoundNotEntangled => 3,
            LifecycleState::EntanglementBroken => 4,
            LifecycleState::Entangled => 5,
        }
    }

    /// Only a broken entanglement calls for a reconciliation
    pub fn is_actionable(self) -> bool {
        matches!(self, LifecycleState::EntanglementBroken)
    }
}

impl TryFrom<i64> for LifecycleState {
    type Error = i64;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(LifecycleState::Pending),
            2 => Ok(LifecycleState::Unbound),
            3 => Ok(LifecycleState::BoundNotEntangled),
            4 => Ok(LifecycleState::EntanglementBroken),
            5 => Ok(LifecycleState::Entangled),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Unbound => "unbound",
            LifecycleState::BoundNotEntangled => "bound_not_entangled",
            LifecycleState::EntanglementBroken => "entanglement_broken",
            LifecycleState::Entangled => "entangled",
        };
        write!(f, "{name}")
    }
}
