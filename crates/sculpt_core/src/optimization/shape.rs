//! Shape variables: the optimization variable is the mesh itself.

use std::rc::Rc;

use nalgebra::DVector;
use tracing::debug;

use crate::config::Config;
use crate::constraints::ConstraintManager;
use crate::error::Result;
use crate::mesh::handler::MeshHandler;
use crate::optimization::variables::VariableAbstraction;
use crate::traits::{Communicator, ReducedProblem};

/// Upper bound on the stepsize reductions of a single variable update.
pub const MAX_UPDATE_DECREASES: usize = 64;

/// Vertex coordinates (in DOF ordering) moved through the [`MeshHandler`],
/// optionally kept feasible for corner-angle constraints.
pub struct ShapeVariables {
    mesh_handler: MeshHandler,
    constraints: Option<ConstraintManager>,
    remesh_iter: usize,
}

impl ShapeVariables {
    pub fn new(mesh_handler: MeshHandler, config: &Config, comm: Rc<dyn Communicator>) -> Self {
        let constraints = if config.mesh_constraints.is_enabled() {
            let deformation = mesh_handler.deformation_handler();
            Some(ConstraintManager::new(
                deformation.mesh(),
                deformation.dof_map(),
                &config.mesh_constraints,
                comm,
            ))
        } else {
            None
        };
        Self {
            mesh_handler,
            constraints,
            remesh_iter: config.mesh_quality.remesh_iter,
        }
    }

    pub fn constraints(&self) -> Option<&ConstraintManager> {
        self.constraints.as_ref()
    }

    pub fn into_mesh_handler(self) -> MeshHandler {
        self.mesh_handler
    }

    /// Deformation for a trial `stepsize`; with constraints the step is
    /// projected onto the working set and possibly shortened.
    fn trial_deformation(
        &self,
        direction: &DVector<f64>,
        stepsize: f64,
        problem: &dyn ReducedProblem,
    ) -> Result<(DVector<f64>, f64)> {
        match &self.constraints {
            Some(manager) if !manager.is_empty() => {
                let x = self.mesh_handler.coordinate_dofs()?;
                let jacobian = manager.constraint_gradient(&x);
                let (y, stepsize) = manager.compute_step(
                    &x,
                    direction,
                    stepsize,
                    &jacobian,
                    problem.scalar_product_matrix(),
                )?;
                Ok((y - x, stepsize))
            }
            _ => Ok((direction * stepsize, stepsize)),
        }
    }
}

impl VariableAbstraction for ShapeVariables {
    fn current(&self) -> Result<DVector<f64>> {
        self.mesh_handler.coordinate_dofs()
    }

    /// Updates the working set of the mesh constraints.
    fn compute_active_sets(&mut self, gradient: &DVector<f64>) -> Result<()> {
        let x = self.mesh_handler.coordinate_dofs()?;
        if let Some(manager) = self.constraints.as_mut() {
            manager.update_working_set(&x, gradient)?;
        }
        Ok(())
    }

    fn restrict_to_inactive_set(&self, v: &DVector<f64>) -> Result<DVector<f64>> {
        match &self.constraints {
            Some(manager) if !manager.is_empty() => {
                let x = self.mesh_handler.coordinate_dofs()?;
                manager.project_direction(&x, v)
            }
            _ => Ok(v.clone()),
        }
    }

    fn restrict_to_active_set(&self, v: &DVector<f64>) -> Result<DVector<f64>> {
        Ok(v - self.restrict_to_inactive_set(v)?)
    }

    fn compute_gradient_norm(
        &self,
        gradient: &DVector<f64>,
        problem: &dyn ReducedProblem,
    ) -> Result<f64> {
        let projected = self.restrict_to_inactive_set(gradient)?;
        Ok(problem.scalar_product(&projected, &projected).sqrt())
    }

    fn compute_decrease_measure(
        &self,
        gradient: &DVector<f64>,
        direction: &DVector<f64>,
        stepsize: f64,
        problem: &dyn ReducedProblem,
    ) -> f64 {
        stepsize * problem.scalar_product(gradient, direction)
    }

    /// Shrinks the stepsize until the mesh moves validly and its quality stays
    /// at or above `tol_lower`.
    fn update_optimization_variables(
        &mut self,
        direction: &DVector<f64>,
        stepsize: f64,
        beta: f64,
        problem: &dyn ReducedProblem,
    ) -> Result<Option<f64>> {
        let tol_lower = self.mesh_handler.quality().tol_lower;
        let mut stepsize = stepsize;
        for _ in 0..MAX_UPDATE_DECREASES {
            let (deformation, used) = self.trial_deformation(direction, stepsize, problem)?;
            stepsize = used;
            if self.mesh_handler.move_mesh(&deformation)? {
                if self.mesh_handler.current_quality() < tol_lower {
                    debug!(
                        quality = self.mesh_handler.current_quality(),
                        stepsize, "mesh quality below tol_lower, reducing stepsize"
                    );
                    self.mesh_handler.revert_transformation();
                    stepsize /= beta;
                    continue;
                }
                return Ok(Some(stepsize));
            }
            stepsize /= beta;
        }
        Ok(None)
    }

    fn revert_variable_update(&mut self) {
        self.mesh_handler.revert_transformation();
    }

    fn compute_a_priori_decreases(&self, direction: &DVector<f64>, stepsize: f64) -> Result<usize> {
        self.mesh_handler.compute_decreases(direction, stepsize)
    }

    fn requires_remeshing(&self, iteration: usize) -> bool {
        self.mesh_handler.requires_remeshing(iteration, self.remesh_iter)
    }

    fn mesh_quality(&self) -> Option<f64> {
        Some(self.mesh_handler.current_quality())
    }

    fn is_constrained(&self) -> bool {
        self.constraints.as_ref().is_some_and(|c| !c.is_empty())
    }

    fn mesh_handler(&self) -> Option<&MeshHandler> {
        Some(&self.mesh_handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::regular_mesh;
    use crate::optimization::test_problems::Quadratic;
    use crate::traits::SerialCommunicator;
    use approx::assert_relative_eq;

    fn shape(config: &Config) -> ShapeVariables {
        let comm: Rc<dyn Communicator> = Rc::new(SerialCommunicator);
        let mesh = regular_mesh(2, 1.0, 1.0).unwrap();
        let handler = MeshHandler::new(mesh, config, comm.clone()).unwrap();
        ShapeVariables::new(handler, config, comm)
    }

    /// Moves vertex `vertex` of the mesh along x.
    fn push_vertex(variables: &ShapeVariables, vertex: usize, amount: f64) -> DVector<f64> {
        let dof_map = variables.mesh_handler().unwrap().deformation_handler().dof_map();
        let mut direction = DVector::zeros(dof_map.len());
        direction[dof_map.dof(vertex, 0)] = amount;
        direction
    }

    #[test]
    fn test_invalid_step_is_shrunk_until_valid() {
        let config = Config::default();
        let mut variables = shape(&config);
        let problem = Quadratic::new(vec![0.0; 18], vec![1.0; 18]);
        let before = variables.current().unwrap();
        // the center vertex (index 4) crossing its neighbours folds cells
        let direction = push_vertex(&variables, 4, 0.7);
        // 1.4 and 0.7 fold the cells right of the center, 0.35 does not
        let used = variables
            .update_optimization_variables(&direction, 2.0, 2.0, &problem)
            .unwrap()
            .unwrap();
        assert_eq!(used, 0.5);
        let after = variables.current().unwrap();
        assert_relative_eq!((&after - &before).amax(), 0.35, epsilon = 1e-12);

        variables.revert_variable_update();
        assert_eq!(variables.current().unwrap(), before);
    }

    #[test]
    fn test_quality_floor_rejects_updates() {
        let mut config = Config::default();
        config.mesh_quality.tol_lower = 0.3;
        config.mesh_quality.tol_upper = 0.5;
        let mut variables = shape(&config);
        let problem = Quadratic::new(vec![0.0; 18], vec![1.0; 18]);
        let direction = push_vertex(&variables, 4, 1.0);
        let used = variables
            .update_optimization_variables(&direction, 0.45, 2.0, &problem)
            .unwrap()
            .unwrap();
        assert!(variables.mesh_quality().unwrap() >= 0.3);
        assert!(used < 0.45);
    }

    #[test]
    fn test_remeshing_request_follows_quality() {
        let mut config = Config::default();
        config.mesh_quality.tol_upper = 0.6;
        config.mesh_quality.remesh_iter = 4;
        let variables = shape(&config);
        assert!(!variables.requires_remeshing(1));
        assert!(variables.requires_remeshing(4));
    }

    #[test]
    fn test_unconstrained_restrictions() {
        let variables = shape(&Config::default());
        let v = DVector::from_element(18, 1.0);
        assert_eq!(variables.restrict_to_inactive_set(&v).unwrap(), v);
        assert_eq!(variables.restrict_to_active_set(&v).unwrap().amax(), 0.0);
        assert!(!variables.is_constrained());
    }
}
