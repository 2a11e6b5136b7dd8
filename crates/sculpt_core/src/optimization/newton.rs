//! Truncated Newton directions through the linear-solve contract.

use nalgebra::DVector;
use tracing::{debug, warn};

use crate::config::NewtonConfig;
use crate::error::{Result, SculptError};
use crate::linalg::{solver_from_options, LinearOperator, LinearSolver, SolverOptions};
use crate::optimization::variables::VariableAbstraction;
use crate::traits::ReducedProblem;

/// The reduced Hessian restricted to the inactive set, identity on the active set.
struct ReducedHessian<'a> {
    problem: &'a mut dyn ReducedProblem,
    variables: &'a dyn VariableAbstraction,
    x: &'a DVector<f64>,
    available: bool,
}

impl LinearOperator for ReducedHessian<'_> {
    fn nrows(&self) -> usize {
        self.x.len()
    }

    fn apply(&mut self, v: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        let inactive = self.variables.restrict_to_inactive_set(v)?;
        let mut hv = DVector::zeros(v.len());
        if !self.problem.hessian_action(self.x, &inactive, &mut hv)? {
            self.available = false;
            return Err(SculptError::invalid_input(
                "newton",
                "the problem provides no Hessian action",
            ));
        }
        *out = self.variables.restrict_to_inactive_set(&hv)? + self.variables.restrict_to_active_set(v)?;
        Ok(())
    }
}

/// Solves `H d = -g` on the inactive set.
pub struct NewtonMethod {
    solver: Box<dyn LinearSolver>,
    options: SolverOptions,
    has_curvature_info: bool,
}

impl NewtonMethod {
    pub fn new(config: &NewtonConfig) -> Result<Self> {
        let options = SolverOptions::new()
            .with("ksp_type", &config.inner_newton)
            .with("ksp_rtol", config.inner_newton_rtol)
            .with("ksp_atol", config.inner_newton_atol)
            .with("ksp_max_it", config.max_it_inner_newton)
            .with("pc_type", "none");
        Ok(Self {
            solver: solver_from_options(&options)?,
            options,
            has_curvature_info: true,
        })
    }

    pub fn has_curvature_info(&self) -> bool {
        self.has_curvature_info
    }

    pub fn reset(&mut self) {
        self.has_curvature_info = true;
    }

    /// Falls back to `-g` when the problem has no Hessian; solver failures
    /// propagate.
    pub fn compute_search_direction(
        &mut self,
        problem: &mut dyn ReducedProblem,
        variables: &dyn VariableAbstraction,
        x: &DVector<f64>,
        gradient: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        let rhs = -variables.restrict_to_inactive_set(gradient)?;
        let mut operator = ReducedHessian {
            problem,
            variables,
            x,
            available: true,
        };
        let solution = self.solver.solve(&mut operator, &rhs, &self.options);
        if !operator.available {
            warn!("no Hessian available, using the negative gradient as Newton direction");
            self.has_curvature_info = false;
            return Ok(-gradient);
        }
        let solution = solution?;
        debug!(solver = self.solver.name(), "solved Newton system");
        self.has_curvature_info = true;
        Ok(variables.restrict_to_inactive_set(&solution)? - variables.restrict_to_active_set(gradient)?)
    }
}
