use serde::{Deserialize, Serialize};

/// Role of a constraint in the current outer iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintStatus {
    /// Binding; treated as an equality during projection.
    Active,
    /// Binding, but released because its multiplier estimate has the wrong sign.
    Dropped,
    Inactive,
}

/// Partition of the constraints into active, dropped and inactive ones.
///
/// One status per constraint, so the three parts are disjoint and cover every
/// constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingSet {
    status: Vec<ConstraintStatus>,
}

impl WorkingSet {
    pub fn new(len: usize) -> Self {
        Self {
            status: vec![ConstraintStatus::Inactive; len],
        }
    }

    pub fn from_active(active: &[bool]) -> Self {
        Self {
            status: active
                .iter()
                .map(|&a| {
                    if a {
                        ConstraintStatus::Active
                    } else {
                        ConstraintStatus::Inactive
                    }
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }

    pub fn status(&self, index: usize) -> ConstraintStatus {
        self.status[index]
    }

    pub(crate) fn set(&mut self, index: usize, status: ConstraintStatus) {
        self.status[index] = status;
    }

    pub fn mask(&self, status: ConstraintStatus) -> Vec<bool> {
        self.status.iter().map(|&s| s == status).collect()
    }

    pub fn active_mask(&self) -> Vec<bool> {
        self.mask(ConstraintStatus::Active)
    }

    pub fn dropped_mask(&self) -> Vec<bool> {
        self.mask(ConstraintStatus::Dropped)
    }

    pub fn inactive_mask(&self) -> Vec<bool> {
        self.mask(ConstraintStatus::Inactive)
    }

    pub fn count(&self, status: ConstraintStatus) -> usize {
        self.status.iter().filter(|&&s| s == status).count()
    }

    pub fn active_indices(&self) -> Vec<usize> {
        self.status
            .iter()
            .enumerate()
            .filter(|(_, &s)| s == ConstraintStatus::Active)
            .map(|(i, _)| i)
            .collect()
    }
}
