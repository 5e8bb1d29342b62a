use serde::Serialize;
use std::fmt;

use crate::constants::LifecycleState;

/// A point-in-time lifecycle reading for one twin instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metric {
    pub app_id: i64,
    pub digital_twin: String,
    pub affinity: String,
    #[serde(serialize_with = "serialize_state")]
    pub lifecycle_state: LifecycleState,
}

impl Metric {
    pub fn new(
        app_id: i64,
        digital_twin: impl Into<String>,
        affinity: impl Into<String>,
        lifecycle_state: LifecycleState,
    ) -> Self {
        Self {
            app_id,
            digital_twin: digital_twin.into(),
            affinity: affinity.into(),
            lifecycle_state,
        }
    }

    pub fn entanglement_broken(
        app_id: i64,
        digital_twin: impl Into<String>,
        affinity: impl Into<String>,
    ) -> Self {
        Self::new(
            app_id,
            digital_twin,
            affinity,
            LifecycleState::EntanglementBroken,
        )
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "app={} twin={} affinity={} state={}",
            self.app_id, self.digital_twin, self.affinity, self.lifecycle_state
        )
    }
}

fn serialize_state<S: serde::Serializer>(
    state: &LifecycleState,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_i64(state.code())
}
