//! Scale planning for a single build.

/// Desired scale of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DesiredScale {
    /// Target number of idle, allocatable instances.
    pub standing_by: usize,
    /// Hard cap on the total number of instances.
    pub max: usize,
}

/// Observed instances of a build, bucketed by lifecycle state.
///
/// Terminal instances (completed, crashed, unhealthy) are not counted here;
/// they are cleaned up separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopulationCounts {
    /// No state reported yet, including creates not yet visible.
    pub pending: usize,
    pub initializing: usize,
    pub standing_by: usize,
    pub active: usize,
}

impl PopulationCounts {
    /// Instances that are not serving a session.
    pub fn non_active(&self) -> usize {
        self.pending + self.initializing + self.standing_by
    }

    pub fn total(&self) -> usize {
        self.non_active() + self.active
    }
}

/// Per-pass limits on creates and deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_create: usize,
    pub max_delete: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_create: crate::DEFAULT_MAX_CREATE_PER_PASS,
            max_delete: crate::DEFAULT_MAX_DELETE_PER_PASS,
        }
    }
}

/// Creates and deletes to issue in one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScalePlan {
    pub to_create: usize,
    pub to_delete: usize,
}

impl ScalePlan {
    /// Compute the plan for one pass.
    ///
    /// Non-active instances converge on `min(standing_by, max - active)`.
    /// Instances that are not serving a session all count toward the
    /// standing-by target, since pending and initializing ones become
    /// standing-by without further action.
    pub fn compute(desired: DesiredScale, observed: PopulationCounts, limits: BatchLimits) -> Self {
        let target = desired
            .standing_by
            .min(desired.max.saturating_sub(observed.active));
        let non_active = observed.non_active();

        Self {
            to_create: target.saturating_sub(non_active).min(limits.max_create),
            to_delete: non_active.saturating_sub(target).min(limits.max_delete),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.to_create == 0 && self.to_delete == 0
    }
}
