//! Optimal-control variables with optional box constraints.

use nalgebra::DVector;

use crate::error::{Result, SculptError};
use crate::optimization::variables::VariableAbstraction;
use crate::traits::ReducedProblem;

/// A control vector `u` with bounds `lower <= u <= upper`.
///
/// Updates are projected onto the box; a component sitting on a bound is
/// active and excluded from the search directions.
#[derive(Debug, Clone)]
pub struct ControlVariables {
    u: DVector<f64>,
    previous: Option<DVector<f64>>,
    bounds: Option<(DVector<f64>, DVector<f64>)>,
    active_lower: Vec<bool>,
    active_upper: Vec<bool>,
    difference: DVector<f64>,
}

impl ControlVariables {
    pub fn new(initial: DVector<f64>) -> Self {
        let n = initial.len();
        Self {
            u: initial,
            previous: None,
            bounds: None,
            active_lower: vec![false; n],
            active_upper: vec![false; n],
            difference: DVector::zeros(n),
        }
    }

    /// Adds box constraints; the initial control is projected onto the box.
    pub fn with_bounds(mut self, lower: DVector<f64>, upper: DVector<f64>) -> Result<Self> {
        let n = self.u.len();
        if lower.len() != n || upper.len() != n {
            return Err(SculptError::invalid_input(
                "control bounds",
                format!(
                    "expected {n} entries, got {} lower and {} upper",
                    lower.len(),
                    upper.len()
                ),
            ));
        }
        if lower.iter().zip(upper.iter()).any(|(l, u)| l > u) {
            return Err(SculptError::invalid_input(
                "control bounds",
                "lower bound exceeds upper bound",
            ));
        }
        self.bounds = Some((lower, upper));
        self.u = self.project(&self.u);
        Ok(self)
    }

    /// Componentwise projection onto the box.
    pub fn project(&self, v: &DVector<f64>) -> DVector<f64> {
        match &self.bounds {
            Some((lower, upper)) => DVector::from_iterator(
                v.len(),
                v.iter()
                    .zip(lower.iter().zip(upper.iter()))
                    .map(|(&x, (&l, &u))| x.clamp(l, u)),
            ),
            None => v.clone(),
        }
    }

    fn is_active(&self, i: usize) -> bool {
        self.active_lower[i] || self.active_upper[i]
    }
}

impl VariableAbstraction for ControlVariables {
    fn current(&self) -> Result<DVector<f64>> {
        Ok(self.u.clone())
    }

    fn compute_active_sets(&mut self, _gradient: &DVector<f64>) -> Result<()> {
        if let Some((lower, upper)) = &self.bounds {
            for i in 0..self.u.len() {
                self.active_lower[i] = self.u[i] <= lower[i];
                self.active_upper[i] = self.u[i] >= upper[i];
            }
        }
        Ok(())
    }

    fn restrict_to_inactive_set(&self, v: &DVector<f64>) -> Result<DVector<f64>> {
        let mut restricted = v.clone();
        for (i, value) in restricted.iter_mut().enumerate() {
            if self.is_active(i) {
                *value = 0.0;
            }
        }
        Ok(restricted)
    }

    fn restrict_to_active_set(&self, v: &DVector<f64>) -> Result<DVector<f64>> {
        let mut restricted = v.clone();
        for (i, value) in restricted.iter_mut().enumerate() {
            if !self.is_active(i) {
                *value = 0.0;
            }
        }
        Ok(restricted)
    }

    /// `‖P(u - g) - u‖` with box constraints, `‖g‖` otherwise.
    fn compute_gradient_norm(
        &self,
        gradient: &DVector<f64>,
        problem: &dyn ReducedProblem,
    ) -> Result<f64> {
        let measure = if self.bounds.is_some() {
            self.project(&(&self.u - gradient)) - &self.u
        } else {
            gradient.clone()
        };
        Ok(problem.scalar_product(&measure, &measure).sqrt())
    }

    fn compute_decrease_measure(
        &self,
        gradient: &DVector<f64>,
        _direction: &DVector<f64>,
        _stepsize: f64,
        problem: &dyn ReducedProblem,
    ) -> f64 {
        problem.scalar_product(gradient, &self.difference)
    }

    fn update_optimization_variables(
        &mut self,
        direction: &DVector<f64>,
        stepsize: f64,
        _beta: f64,
        _problem: &dyn ReducedProblem,
    ) -> Result<Option<f64>> {
        let updated = self.project(&(&self.u + direction * stepsize));
        self.difference = &updated - &self.u;
        self.previous = Some(std::mem::replace(&mut self.u, updated));
        Ok(Some(stepsize))
    }

    fn revert_variable_update(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.u = previous;
        }
    }

    fn is_constrained(&self) -> bool {
        self.bounds.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::test_problems::Quadratic;

    fn boxed() -> ControlVariables {
        ControlVariables::new(DVector::from_vec(vec![0.5, 2.0, -3.0]))
            .with_bounds(
                DVector::from_vec(vec![-1.0, -1.0, -1.0]),
                DVector::from_vec(vec![1.0, 1.0, 1.0]),
            )
            .unwrap()
    }

    #[test]
    fn test_initial_control_is_projected() {
        let controls = boxed();
        assert_eq!(controls.current().unwrap().as_slice(), &[0.5, 1.0, -1.0]);
    }

    #[test]
    fn test_active_sets_and_restrictions() {
        let mut controls = boxed();
        let gradient = DVector::from_vec(vec![1.0, -1.0, 1.0]);
        controls.compute_active_sets(&gradient).unwrap();
        let v = DVector::from_vec(vec![3.0, 4.0, 5.0]);
        assert_eq!(controls.restrict_to_inactive_set(&v).unwrap().as_slice(), &[3.0, 0.0, 0.0]);
        assert_eq!(controls.restrict_to_active_set(&v).unwrap().as_slice(), &[0.0, 4.0, 5.0]);
    }

    #[test]
    fn test_stationarity_measure_vanishes_at_bound() {
        let controls = boxed();
        let problem = Quadratic::new(vec![0.0; 3], vec![1.0; 3]);
        // pushing outward at both bounds, zero in the free component
        let gradient = DVector::from_vec(vec![0.0, -5.0, 5.0]);
        assert_eq!(controls.compute_gradient_norm(&gradient, &problem).unwrap(), 0.0);
    }

    #[test]
    fn test_update_projects_and_reverts() {
        let mut controls = boxed();
        let problem = Quadratic::new(vec![0.0; 3], vec![1.0; 3]);
        let direction = DVector::from_vec(vec![1.0, 1.0, 1.0]);
        let used = controls
            .update_optimization_variables(&direction, 1.0, 2.0, &problem)
            .unwrap();
        assert_eq!(used, Some(1.0));
        assert_eq!(controls.current().unwrap().as_slice(), &[1.0, 1.0, 0.0]);

        let gradient = DVector::from_vec(vec![1.0, 1.0, 1.0]);
        let decrease = controls.compute_decrease_measure(&gradient, &direction, 1.0, &problem);
        assert_eq!(decrease, 1.5);

        controls.revert_variable_update();
        assert_eq!(controls.current().unwrap().as_slice(), &[0.5, 1.0, -1.0]);
    }
}
