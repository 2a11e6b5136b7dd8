//! Limited-memory BFGS with a bounded curvature memory.

use std::collections::VecDeque;

use nalgebra::DVector;
use tracing::debug;

use crate::config::LbfgsConfig;
use crate::error::Result;
use crate::optimization::variables::VariableAbstraction;
use crate::optimization::MemoryUpdate;
use crate::traits::ReducedProblem;

/// Pairs with `yᵀs / (‖s‖‖y‖)` at or below this value are rejected.
pub const CURVATURE_TOLERANCE: f64 = 1e-14;

/// The most recent `(s, y, ρ)` triples, newest first.
///
/// The three queues always have the same length, at most `capacity`.
#[derive(Debug, Clone)]
pub struct CurvatureMemory {
    capacity: usize,
    s: VecDeque<DVector<f64>>,
    y: VecDeque<DVector<f64>>,
    rho: VecDeque<f64>,
}

impl CurvatureMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            s: VecDeque::with_capacity(capacity + 1),
            y: VecDeque::with_capacity(capacity + 1),
            rho: VecDeque::with_capacity(capacity + 1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.s.len()
    }

    pub fn is_empty(&self) -> bool {
        self.s.is_empty()
    }

    /// Drops all pairs at once.
    pub fn clear(&mut self) {
        self.s.clear();
        self.y.clear();
        self.rho.clear();
    }

    /// Pushes a pair to the front and evicts the oldest one beyond capacity.
    pub fn push(&mut self, s: DVector<f64>, y: DVector<f64>, rho: f64) {
        if self.capacity == 0 {
            return;
        }
        self.s.push_front(s);
        self.y.push_front(y);
        self.rho.push_front(rho);
        if self.s.len() > self.capacity {
            self.s.pop_back();
            self.y.pop_back();
            self.rho.pop_back();
        }
    }

    /// `(s, y, ρ)`, newest first.
    pub fn iter(
        &self,
    ) -> impl DoubleEndedIterator<Item = (&DVector<f64>, &DVector<f64>, f64)> + ExactSizeIterator {
        self.s
            .iter()
            .zip(self.y.iter())
            .zip(self.rho.iter())
            .map(|((s, y), &rho)| (s, y, rho))
    }

    fn newest(&self) -> Option<(&DVector<f64>, &DVector<f64>)> {
        Some((self.s.front()?, self.y.front()?))
    }
}

#[derive(Debug, Clone)]
pub struct LbfgsMethod {
    memory: CurvatureMemory,
    use_scaling: bool,
    periodic_restart: usize,
    has_curvature_info: bool,
}

impl LbfgsMethod {
    pub fn new(config: &LbfgsConfig) -> Self {
        Self {
            memory: CurvatureMemory::new(config.bfgs_memory_size),
            use_scaling: config.use_bfgs_scaling,
            periodic_restart: config.bfgs_periodic_restart,
            has_curvature_info: false,
        }
    }

    pub fn memory(&self) -> &CurvatureMemory {
        &self.memory
    }

    pub fn has_curvature_info(&self) -> bool {
        self.has_curvature_info
    }

    pub fn reset(&mut self) {
        self.memory.clear();
        self.has_curvature_info = false;
    }

    /// Two-loop recursion for `d = -H g`.
    ///
    /// The recursion acts on the inactive part of the gradient; the active part
    /// is added back unscaled before negation.
    pub fn compute_search_direction(
        &self,
        gradient: &DVector<f64>,
        variables: &dyn VariableAbstraction,
        problem: &dyn ReducedProblem,
        iteration: usize,
    ) -> Result<DVector<f64>> {
        if self.memory.is_empty() {
            return Ok(-gradient);
        }

        let mut q = variables.restrict_to_inactive_set(gradient)?;
        let mut alphas = Vec::with_capacity(self.memory.len());
        for (s, y, rho) in self.memory.iter() {
            let alpha = rho * problem.scalar_product(s, &q);
            q.axpy(-alpha, y, 1.0);
            alphas.push(alpha);
        }

        let gamma = match self.memory.newest() {
            Some((s, y)) if self.use_scaling && iteration > 0 => {
                problem.scalar_product(s, y) / problem.scalar_product(y, y)
            }
            _ => 1.0,
        };
        let mut r = variables.restrict_to_inactive_set(&q)? * gamma;

        for ((s, y, rho), alpha) in self.memory.iter().zip(&alphas).rev() {
            let beta = rho * problem.scalar_product(y, &r);
            r.axpy(alpha - beta, s, 1.0);
        }
        let mut direction = variables.restrict_to_inactive_set(&r)?;
        direction += variables.restrict_to_active_set(gradient)?;
        Ok(-direction)
    }

    /// Adds the pair `s = t·d`, `y = g - g_prev` if it satisfies the curvature
    /// condition; otherwise the whole memory is cleared.
    pub fn update_memory(
        &mut self,
        update: &MemoryUpdate<'_>,
        variables: &dyn VariableAbstraction,
        problem: &dyn ReducedProblem,
    ) -> Result<()> {
        if self.memory.capacity() == 0 {
            return Ok(());
        }
        if self.periodic_restart > 0 && update.iteration % self.periodic_restart == 0 {
            debug!(iteration = update.iteration, "periodic restart of the L-BFGS memory");
            self.reset();
            return Ok(());
        }

        let y = variables.restrict_to_inactive_set(&(update.gradient - update.gradient_prev))?;
        let s = variables.restrict_to_inactive_set(&(update.direction * update.stepsize))?;
        let ys = problem.scalar_product(&y, &s);
        let curvature = ys / (problem.scalar_product(&s, &s) * problem.scalar_product(&y, &y)).sqrt();

        if !(curvature > CURVATURE_TOLERANCE) {
            debug!(curvature, "curvature condition violated, clearing L-BFGS memory");
            self.memory.clear();
            self.has_curvature_info = false;
        } else {
            self.memory.push(s, y, 1.0 / ys);
            self.has_curvature_info = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::control::ControlVariables;
    use crate::optimization::test_problems::Quadratic;
    use approx::assert_relative_eq;

    fn identity_problem() -> Quadratic {
        Quadratic::new(vec![0.0; 3], vec![1.0; 3])
    }

    #[test]
    fn test_memory_capacity_and_order() {
        let mut memory = CurvatureMemory::new(3);
        for k in 0..7 {
            let v = DVector::from_element(2, k as f64);
            memory.push(v.clone(), v, k as f64);
            assert!(memory.len() <= 3);
            assert_eq!(memory.s.len(), memory.y.len());
            assert_eq!(memory.y.len(), memory.rho.len());
        }
        let rhos: Vec<f64> = memory.iter().map(|(_, _, rho)| rho).collect();
        assert_eq!(rhos, vec![6.0, 5.0, 4.0]);
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut memory = CurvatureMemory::new(0);
        memory.push(DVector::zeros(1), DVector::zeros(1), 1.0);
        assert!(memory.is_empty());
    }

    #[test]
    fn test_empty_memory_gives_steepest_descent() {
        let method = LbfgsMethod::new(&LbfgsConfig::default());
        let controls = ControlVariables::new(DVector::zeros(3));
        let g = DVector::from_vec(vec![1.0, -2.0, 3.0]);
        let d = method
            .compute_search_direction(&g, &controls, &identity_problem(), 0)
            .unwrap();
        assert_eq!(d, -g);
    }

    #[test]
    fn test_secant_equation_for_single_pair() {
        let mut method = LbfgsMethod::new(&LbfgsConfig::default());
        let controls = ControlVariables::new(DVector::zeros(3));
        let problem = identity_problem();
        let gradient_prev = DVector::from_vec(vec![1.0, 0.0, 0.0]);
        let gradient = DVector::from_vec(vec![3.0, 1.0, 0.5]);
        let direction = DVector::from_vec(vec![1.0, 2.0, -1.0]);
        method
            .update_memory(
                &MemoryUpdate {
                    gradient: &gradient,
                    gradient_prev: &gradient_prev,
                    direction: &direction,
                    stepsize: 0.5,
                    iteration: 1,
                },
                &controls,
                &problem,
            )
            .unwrap();
        assert!(method.has_curvature_info());
        assert_eq!(method.memory().len(), 1);

        // H y = s for the pair just stored
        let y = &gradient - &gradient_prev;
        let s = &direction * 0.5;
        let d = method
            .compute_search_direction(&y, &controls, &problem, 1)
            .unwrap();
        for i in 0..3 {
            assert_relative_eq!(d[i], -s[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_failed_curvature_clears_everything() {
        let mut method = LbfgsMethod::new(&LbfgsConfig::default());
        let controls = ControlVariables::new(DVector::zeros(3));
        let problem = identity_problem();
        let direction = DVector::from_vec(vec![1.0, 0.0, 0.0]);
        let good = DVector::from_vec(vec![1.0, 0.0, 0.0]);
        let zero = DVector::zeros(3);
        for _ in 0..3 {
            method
                .update_memory(
                    &MemoryUpdate {
                        gradient: &good,
                        gradient_prev: &zero,
                        direction: &direction,
                        stepsize: 1.0,
                        iteration: 1,
                    },
                    &controls,
                    &problem,
                )
                .unwrap();
        }
        assert_eq!(method.memory().len(), 3);

        // y = 0 violates the curvature condition
        method
            .update_memory(
                &MemoryUpdate {
                    gradient: &good,
                    gradient_prev: &good,
                    direction: &direction,
                    stepsize: 1.0,
                    iteration: 2,
                },
                &controls,
                &problem,
            )
            .unwrap();
        assert!(method.memory().is_empty());
        assert!(!method.has_curvature_info());
    }
}
