use anyhow::Result;
use nalgebra::DVector;

/// Number of PDE solves a problem has performed, reported in summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SolveCounts {
    pub state: usize,
    pub adjoint: usize,
}

/// The reduced optimization problem as seen by the optimization core.
///
/// Implementations own the discretized PDE (state, adjoint and gradient systems)
/// and are consulted through a "solve system, return solution vector" contract.
/// All vectors live in the DOF ordering of the control space; for shape problems
/// the control is the vertex coordinate field of the mesh.
pub trait ReducedProblem {
    /// Number of control degrees of freedom.
    fn dimension(&self) -> usize;

    /// Solves the state system at `x` and returns the reduced objective value.
    fn objective(&mut self, x: &DVector<f64>) -> Result<f64>;

    /// Writes the Riesz representative of the reduced gradient at `x` into `out`.
    fn gradient(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> Result<()>;

    /// Applies the reduced Hessian at `x` to `direction`.
    /// Returns `Ok(false)` when the problem provides no second-order information.
    fn hessian_action(
        &mut self,
        _x: &DVector<f64>,
        _direction: &DVector<f64>,
        _out: &mut DVector<f64>,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Inner product of the control space.
    fn scalar_product(&self, a: &DVector<f64>, b: &DVector<f64>) -> f64 {
        a.dot(b)
    }

    /// Matrix of the inner product, if it is available in assembled form.
    fn scalar_product_matrix(&self) -> Option<&nalgebra_sparse::CsrMatrix<f64>> {
        None
    }

    fn solve_counts(&self) -> SolveCounts {
        SolveCounts::default()
    }
}

/// Collective operations over the ranks that share a distributed mesh.
///
/// Every feasibility, convergence and quality decision is reduced through this
/// interface before any rank acts on it.
pub trait Communicator {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn all_and(&self, local: bool) -> bool;
    fn all_max(&self, local: f64) -> f64;
    fn all_min(&self, local: f64) -> f64;
    fn all_sum(&self, local: f64) -> f64;
    fn barrier(&self);

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// Single-process communicator: every reduction is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialCommunicator;

impl Communicator for SerialCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_and(&self, local: bool) -> bool {
        local
    }

    fn all_max(&self, local: f64) -> f64 {
        local
    }

    fn all_min(&self, local: f64) -> f64 {
        local
    }

    fn all_sum(&self, local: f64) -> f64 {
        local
    }

    fn barrier(&self) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;

    use super::Communicator;

    /// Rank 0 of two ranks whose partitions are identical, except that the
    /// other rank's minimum is `remote_min`. Records every collective it sees.
    pub struct MirroredCommunicator {
        pub remote_min: f64,
        pub calls: RefCell<Vec<&'static str>>,
    }

    impl MirroredCommunicator {
        pub fn new(remote_min: f64) -> Self {
            Self {
                remote_min,
                calls: RefCell::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<&'static str> {
            self.calls.borrow().clone()
        }
    }

    impl Communicator for MirroredCommunicator {
        fn rank(&self) -> usize {
            0
        }

        fn size(&self) -> usize {
            2
        }

        fn all_and(&self, local: bool) -> bool {
            self.calls.borrow_mut().push("and");
            local
        }

        fn all_max(&self, local: f64) -> f64 {
            self.calls.borrow_mut().push("max");
            local
        }

        fn all_min(&self, local: f64) -> f64 {
            self.calls.borrow_mut().push("min");
            local.min(self.remote_min)
        }

        fn all_sum(&self, local: f64) -> f64 {
            self.calls.borrow_mut().push("sum");
            2.0 * local
        }

        fn barrier(&self) {
            self.calls.borrow_mut().push("barrier");
        }
    }
}
