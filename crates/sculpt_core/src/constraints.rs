//! Mesh-quality constraints on the vertex positions and the working-set
//! machinery that keeps shape updates feasible.
//!
//! All coordinate vectors in this module are in DOF ordering. A constraint is
//! satisfied iff its value `g` is at most `tol`; it binds iff `|g| <= tol`.

pub mod angle;
pub mod working_set;

use std::rc::Rc;

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::factorization::CscCholesky;
use nalgebra_sparse::{CooMatrix, CscMatrix, CsrMatrix};
use tracing::{debug, info};

use crate::config::{MeshConstraintsConfig, ProjectionMode};
use crate::error::{Result, SculptError};
use crate::linalg::{
    csr_mul, csr_to_dense, csr_transpose_mul, select_rows, solve_dense_robust, ConjugateGradient,
    GramOperator, LinearSolver, SolverOptions,
};
use crate::mesh::dof_map::DofMap;
use crate::mesh::Mesh;
use crate::traits::Communicator;

use angle::{corner_constraints, AngleConstraint};
use working_set::{ConstraintStatus, WorkingSet};

/// Correction iterations of the projection onto the working set.
pub const PROJECTION_ITERATIONS: usize = 10;

/// Below this stepsize a failing projection is reported as an error.
pub const MINIMAL_STEPSIZE: f64 = 1e-12;

const BISECTION_XTOL: f64 = 1e-10;

/// `|g| <= tol` for every entry.
pub fn active_mask(values: &[f64], tol: f64) -> Vec<bool> {
    values.iter().map(|g| g.abs() <= tol).collect()
}

/// Owns the constraints and the working set.
pub struct ConstraintManager {
    constraints: Vec<AngleConstraint>,
    dof_map: DofMap,
    min_angle: f64,
    tol: f64,
    mode: ProjectionMode,
    working_set: WorkingSet,
    comm: Rc<dyn Communicator>,
}

impl ConstraintManager {
    pub fn new(
        mesh: &Mesh,
        dof_map: &DofMap,
        config: &MeshConstraintsConfig,
        comm: Rc<dyn Communicator>,
    ) -> Self {
        let constraints = if config.is_enabled() {
            corner_constraints(mesh)
        } else {
            Vec::new()
        };
        let working_set = WorkingSet::new(constraints.len());
        info!(
            constraints = constraints.len(),
            min_angle = config.min_angle,
            "initialized mesh quality constraints"
        );
        Self {
            constraints,
            dof_map: dof_map.clone(),
            min_angle: config.min_angle.to_radians(),
            tol: config.tol,
            mode: config.mode,
            working_set,
            comm,
        }
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn tol(&self) -> f64 {
        self.tol
    }

    pub fn working_set(&self) -> &WorkingSet {
        &self.working_set
    }

    pub fn evaluate(&self, x: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.len(),
            self.constraints
                .iter()
                .map(|c| self.min_angle - c.angle(x, &self.dof_map)),
        )
    }

    pub fn active_set(&self, x: &DVector<f64>) -> Vec<bool> {
        active_mask(self.evaluate(x).as_slice(), self.tol)
    }

    pub fn is_feasible(&self, x: &DVector<f64>) -> Vec<bool> {
        self.evaluate(x).iter().map(|&g| g <= self.tol).collect()
    }

    /// Jacobian of the constraint values: one row per constraint, one column per DOF.
    pub fn constraint_gradient(&self, x: &DVector<f64>) -> CsrMatrix<f64> {
        let dim = self.dof_map.dim();
        let mut coo = CooMatrix::new(self.len(), self.dof_map.len());
        for (row, constraint) in self.constraints.iter().enumerate() {
            for (vertex, derivative) in constraint.angle_gradient(x, &self.dof_map) {
                for (c, &value) in derivative.iter().enumerate().take(dim) {
                    coo.push(row, self.dof_map.dof(vertex, c), -value);
                }
            }
        }
        CsrMatrix::from(&coo)
    }

    /// Starts the working set from the constraints binding at `x`.
    pub fn initialize_working_set(&mut self, x: &DVector<f64>) {
        self.working_set = WorkingSet::from_active(&self.active_set(x));
    }

    /// Recomputes the working set between outer iterations.
    ///
    /// Binding constraints become active, then the multiplier estimate from
    /// `A Aᵀ μ = -A ∇J` releases the ones with `μ < 0` into the dropped set.
    pub fn update_working_set(&mut self, x: &DVector<f64>, gradient: &DVector<f64>) -> Result<()> {
        let binding = self.active_set(x);
        let mut working_set = WorkingSet::from_active(&binding);
        let active = working_set.active_indices();
        if !active.is_empty() {
            let a = select_rows(&self.constraint_gradient(x), &binding);
            let dense = csr_to_dense(&a);
            let gram = &dense * dense.transpose();
            let rhs = -csr_mul(&a, gradient);
            let multipliers = solve_dense_robust(gram, &rhs)?;
            for (k, &index) in active.iter().enumerate() {
                if multipliers[k] < 0.0 {
                    working_set.set(index, ConstraintStatus::Dropped);
                }
            }
        }
        debug!(
            active = working_set.count(ConstraintStatus::Active),
            dropped = working_set.count(ConstraintStatus::Dropped),
            "updated working set"
        );
        self.working_set = working_set;
        Ok(())
    }

    /// Projects `direction` onto the null space of the active constraint gradients.
    pub fn project_direction(&self, x: &DVector<f64>, direction: &DVector<f64>) -> Result<DVector<f64>> {
        let active = self.working_set.active_mask();
        if !active.iter().any(|&a| a) {
            return Ok(direction.clone());
        }
        let a = select_rows(&self.constraint_gradient(x), &active);
        let dense = csr_to_dense(&a);
        let gram = &dense * dense.transpose();
        let lambda = solve_dense_robust(gram, &csr_mul(&a, direction))?;
        Ok(direction - csr_transpose_mul(&a, &lambda))
    }

    /// Pulls the trial point `x + stepsize · direction` back onto the constraints
    /// selected by `active`, linearized with the rows of `gradient`.
    ///
    /// Returns `Ok(None)` if the active constraints are still violated after
    /// [`PROJECTION_ITERATIONS`] corrections. `scalar_product` is the matrix `S` of
    /// the control inner product used by the complete mode (identity if `None`).
    pub fn project_to_working_set(
        &self,
        x: &DVector<f64>,
        direction: &DVector<f64>,
        stepsize: f64,
        active: &[bool],
        gradient: &CsrMatrix<f64>,
        scalar_product: Option<&CsrMatrix<f64>>,
    ) -> Result<Option<DVector<f64>>> {
        let mut y = x + direction * stepsize;
        let a = select_rows(gradient, active);
        let active_indices: Vec<usize> = (0..active.len()).filter(|&i| active[i]).collect();

        let complete = match (self.mode, scalar_product) {
            (ProjectionMode::Complete, Some(s)) => Some(self.complete_projection_operator(&a, s)?),
            (ProjectionMode::Complete, None) => {
                let dense = csr_to_dense(&a);
                let s_inv_at = dense.transpose();
                let gram = &dense * &s_inv_at;
                Some((s_inv_at, gram))
            }
            (ProjectionMode::Approximate, _) => None,
        };

        for _ in 0..PROJECTION_ITERATIONS {
            let values = self.evaluate(&y);
            let satisfied = active_indices.iter().all(|&i| values[i].abs() <= self.tol);
            if self.comm.all_and(satisfied) {
                return Ok(Some(y));
            }
            let h = DVector::from_iterator(active_indices.len(), active_indices.iter().map(|&i| values[i]));

            match &complete {
                Some((s_inv_at, gram)) => {
                    let lambda = solve_dense_robust(gram.clone(), &h)?;
                    y -= s_inv_at * lambda;
                }
                None => {
                    let options = SolverOptions::new()
                        .with("ksp_type", "cg")
                        .with("ksp_max_it", 1000)
                        .with("ksp_rtol", self.tol / 1e2)
                        .with("ksp_atol", 1e-30)
                        .with("pc_type", "jacobi");
                    let mut operator = GramOperator::new(&a);
                    let lambda = ConjugateGradient
                        .solve(&mut operator, &h, &options)
                        .map_err(|e| SculptError::ProjectionFailed(e.to_string()))?;
                    y -= csr_transpose_mul(&a, &lambda);
                }
            }
        }
        Ok(None)
    }

    /// `S⁻¹ Aᵀ` and `A S⁻¹ Aᵀ` from a sparse Cholesky factorization of `S`.
    fn complete_projection_operator(
        &self,
        a: &CsrMatrix<f64>,
        s: &CsrMatrix<f64>,
    ) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
        let factor = CscCholesky::factor(&CscMatrix::from(s)).map_err(|e| {
            SculptError::ProjectionFailed(format!("scalar product matrix is not SPD: {e:?}"))
        })?;
        let dense = csr_to_dense(a);
        let s_inv_at = factor.solve(&dense.transpose());
        let gram = &dense * &s_inv_at;
        Ok((s_inv_at, gram))
    }

    /// Computes a feasible step along `direction` using the current working set.
    ///
    /// The stepsize is halved while the projection fails. If the projected step
    /// violates a constraint outside the working set, the stepsize is reduced by
    /// bisection on the margin `max g_inactive(project(t))`; the feasible end of
    /// the bracket is returned, so the result satisfies every non-dropped
    /// constraint.
    pub fn compute_step(
        &self,
        x: &DVector<f64>,
        direction: &DVector<f64>,
        mut stepsize: f64,
        gradient: &CsrMatrix<f64>,
        scalar_product: Option<&CsrMatrix<f64>>,
    ) -> Result<(DVector<f64>, f64)> {
        let active = self.working_set.active_mask();
        let inactive = self.working_set.inactive_mask();

        let trial = loop {
            self.comm.barrier();
            let projected =
                self.project_to_working_set(x, direction, stepsize, &active, gradient, scalar_product)?;
            self.comm.barrier();
            match projected {
                Some(step) => break step,
                None if stepsize > MINIMAL_STEPSIZE => stepsize /= 2.0,
                None => {
                    return Err(SculptError::ProjectionFailed(format!(
                        "projection onto the working set did not converge for stepsize {stepsize:e}"
                    )))
                }
            }
        };

        let margin_of = |y: &DVector<f64>| -> f64 {
            let values = self.evaluate(y);
            let local = values
                .iter()
                .zip(&inactive)
                .filter(|(_, &keep)| keep)
                .map(|(&g, _)| g)
                .fold(f64::NEG_INFINITY, f64::max);
            self.comm.all_max(local)
        };

        if margin_of(&trial) <= self.tol {
            return Ok((trial, stepsize));
        }

        debug!(stepsize, "truncating step to stay feasible");
        let mut lower = 0.0;
        let mut upper = stepsize;
        while upper - lower > BISECTION_XTOL {
            let mid = 0.5 * (lower + upper);
            let projected =
                self.project_to_working_set(x, direction, mid, &active, gradient, scalar_product)?;
            match projected {
                Some(y) if margin_of(&y) <= self.tol => lower = mid,
                _ => upper = mid,
            }
        }
        let feasible_stepsize = self.comm.all_min(lower);
        let step = self
            .project_to_working_set(x, direction, feasible_stepsize, &active, gradient, scalar_product)?
            .ok_or_else(|| {
                SculptError::ProjectionFailed("no feasible step along the search direction".to_string())
            })?;
        Ok((step, feasible_stepsize))
    }
}
