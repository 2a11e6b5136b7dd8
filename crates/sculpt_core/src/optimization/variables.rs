use nalgebra::DVector;

use crate::error::Result;
use crate::mesh::handler::MeshHandler;
use crate::traits::ReducedProblem;

/// The optimization variable as seen by the direction engines and line searches.
///
/// Implemented by [`ControlVariables`](super::control::ControlVariables) for
/// optimal control and [`ShapeVariables`](super::shape::ShapeVariables) for
/// shape optimization, where the variable is the mesh itself.
pub trait VariableAbstraction {
    /// Current value of the variable in DOF ordering.
    fn current(&self) -> Result<DVector<f64>>;

    /// Recomputes the active constraints at the current point.
    fn compute_active_sets(&mut self, gradient: &DVector<f64>) -> Result<()>;

    /// Restricts `v` to the directions that do not move active constraints.
    fn restrict_to_inactive_set(&self, v: &DVector<f64>) -> Result<DVector<f64>>;

    /// The complement of [`restrict_to_inactive_set`](Self::restrict_to_inactive_set).
    fn restrict_to_active_set(&self, v: &DVector<f64>) -> Result<DVector<f64>>;

    /// Norm used by the convergence test: the gradient norm, or a stationarity
    /// measure in the presence of constraints.
    fn compute_gradient_norm(
        &self,
        gradient: &DVector<f64>,
        problem: &dyn ReducedProblem,
    ) -> Result<f64>;

    /// Predicted decrease of the last update, used by the Armijo condition.
    fn compute_decrease_measure(
        &self,
        gradient: &DVector<f64>,
        direction: &DVector<f64>,
        stepsize: f64,
        problem: &dyn ReducedProblem,
    ) -> f64;

    /// Applies `stepsize · direction`, possibly with a smaller stepsize.
    ///
    /// Returns the stepsize actually used, or `None` if no admissible update was
    /// found. A successful update can be undone once with
    /// [`revert_variable_update`](Self::revert_variable_update).
    fn update_optimization_variables(
        &mut self,
        direction: &DVector<f64>,
        stepsize: f64,
        beta: f64,
        problem: &dyn ReducedProblem,
    ) -> Result<Option<f64>>;

    fn revert_variable_update(&mut self);

    /// Number of divisions by `beta` to apply to `stepsize` before the first trial.
    fn compute_a_priori_decreases(&self, _direction: &DVector<f64>, _stepsize: f64) -> Result<usize> {
        Ok(0)
    }

    fn requires_remeshing(&self, _iteration: usize) -> bool {
        false
    }

    fn mesh_quality(&self) -> Option<f64> {
        None
    }

    /// Whether constraints restrict the variable.
    fn is_constrained(&self) -> bool;

    fn mesh_handler(&self) -> Option<&MeshHandler> {
        None
    }
}
