//! Backtracking line searches with Armijo acceptance.
//!
//! Both searches share the outer loop: update the variables, evaluate the
//! objective, accept on sufficient decrease or revert and shrink. They differ in
//! how the next trial stepsize is chosen after a rejection.

use nalgebra::DVector;
use tracing::{debug, error};

use crate::config::{Config, LineSearchConfig, LineSearchMethod, PolynomialModel};
use crate::error::Result;
use crate::optimization::variables::VariableAbstraction;
use crate::optimization::OptimizationState;
use crate::traits::ReducedProblem;

/// Trial steps with `stepsize · ‖d‖∞` at or below this value count as failure.
pub const MINIMAL_STEP_LENGTH: f64 = 1e-8;

pub struct LineSearch {
    config: LineSearchConfig,
    maximum_iterations: usize,
    is_newton_like: bool,
    stepsize: f64,
    /// First stepsize accepted at iteration 0; reference for the relative failure test.
    initial_accepted: Option<f64>,
}

impl LineSearch {
    pub fn new(config: &Config, is_newton_like: bool) -> Self {
        Self {
            config: config.line_search,
            maximum_iterations: config.optimization.maximum_iterations,
            is_newton_like,
            stepsize: config.line_search.initial_stepsize,
            initial_accepted: None,
        }
    }

    /// Stepsize the next search starts from.
    pub fn stepsize(&self) -> f64 {
        self.stepsize
    }

    fn initialize_stepsize(
        &mut self,
        variables: &dyn VariableAbstraction,
        problem: &dyn ReducedProblem,
        direction: &DVector<f64>,
        has_curvature_info: bool,
        iteration: usize,
    ) -> Result<()> {
        if has_curvature_info {
            self.stepsize = 1.0;
        }
        let decreases = variables.compute_a_priori_decreases(direction, self.stepsize)?;
        if decreases > 0 {
            debug!(decreases, "a priori stepsize decreases");
            self.stepsize /= self.config.beta_armijo.powi(decreases as i32);
        }
        if self.config.safeguard_stepsize && iteration == 0 {
            let norm = problem.scalar_product(direction, direction).sqrt();
            self.stepsize = self.stepsize.min(100.0 / (1.0 + norm));
        }
        Ok(())
    }

    fn stepsize_too_small(&self, direction_inf: f64) -> bool {
        if self.stepsize * direction_inf <= MINIMAL_STEP_LENGTH {
            return true;
        }
        match self.initial_accepted {
            Some(initial) if !self.is_newton_like => self.stepsize / initial <= MINIMAL_STEP_LENGTH,
            _ => false,
        }
    }

    /// Searches along `direction` and leaves the variables at the accepted point.
    ///
    /// Stopping conditions are reported through the flags of `state`. Returns
    /// `true` if a step was accepted, in which case `state.objective_value` holds
    /// the objective at the new point.
    pub fn perform(
        &mut self,
        problem: &mut dyn ReducedProblem,
        variables: &mut dyn VariableAbstraction,
        state: &mut OptimizationState,
        gradient: &DVector<f64>,
        direction: &DVector<f64>,
        has_curvature_info: bool,
    ) -> Result<bool> {
        self.initialize_stepsize(&*variables, &*problem, direction, has_curvature_info, state.iteration)?;
        let beta = self.config.beta_armijo;
        let current_value = state.objective_value;
        let slope = problem.scalar_product(gradient, direction);
        let direction_inf = direction.amax();
        let mut trials: Vec<(f64, f64)> = Vec::new();

        let objective = loop {
            if state.iteration >= self.maximum_iterations {
                state.remeshing_its = true;
                return Ok(false);
            }
            if self.stepsize_too_small(direction_inf) {
                error!(stepsize = self.stepsize, "Stepsize too small.");
                state.line_search_broken = true;
                return Ok(false);
            }

            let Some(stepsize) =
                variables.update_optimization_variables(direction, self.stepsize, beta, &*problem)?
            else {
                error!(stepsize = self.stepsize, "no admissible variable update along the search direction");
                state.line_search_broken = true;
                return Ok(false);
            };
            self.stepsize = stepsize;

            let x = variables.current()?;
            let objective = problem.objective(&x)?;
            let decrease = variables.compute_decrease_measure(gradient, direction, stepsize, &*problem);
            if objective < current_value + self.config.epsilon_armijo * decrease {
                if variables.requires_remeshing(state.iteration) {
                    state.requires_remeshing = true;
                    return Ok(false);
                }
                if state.iteration == 0 && self.initial_accepted.is_none() {
                    self.initial_accepted = Some(stepsize);
                }
                break objective;
            }

            trials.push((stepsize, objective));
            self.stepsize = match self.config.method {
                LineSearchMethod::Armijo => stepsize / beta,
                LineSearchMethod::Polynomial => polynomial_stepsize(
                    self.config.polynomial_model,
                    current_value,
                    slope,
                    &trials,
                    self.config.factor_low,
                    self.config.factor_high,
                ),
            };
            debug!(rejected = stepsize, next = self.stepsize, "step rejected");
            variables.revert_variable_update();
        };

        state.stepsize = self.stepsize;
        state.objective_value = objective;
        if !has_curvature_info {
            self.stepsize *= beta;
        }
        Ok(true)
    }
}

/// Next trial stepsize from an interpolation model of `φ(t) = J(x + t d)`.
///
/// `trials` holds the rejected `(t, φ(t))` pairs in order. The quadratic model
/// uses `φ(0)`, `φ'(0)` and the last trial; the cubic model additionally the one
/// before it. The result is clamped to `[factor_low·t, factor_high·t]` with `t`
/// the last trial.
pub fn polynomial_stepsize(
    model: PolynomialModel,
    value: f64,
    slope: f64,
    trials: &[(f64, f64)],
    factor_low: f64,
    factor_high: f64,
) -> f64 {
    let Some(&(alpha, f_alpha)) = trials.last() else {
        return 0.0;
    };
    let quadratic = || -slope * alpha * alpha / (2.0 * (f_alpha - value - slope * alpha));

    let candidate = match (model, trials.len()) {
        (PolynomialModel::Cubic, len) if len >= 2 => {
            let (alpha_0, f_0) = trials[len - 2];
            let (alpha_1, f_1) = (alpha, f_alpha);
            let denominator = alpha_0 * alpha_0 * alpha_1 * alpha_1 * (alpha_1 - alpha_0);
            let r_1 = f_1 - value - slope * alpha_1;
            let r_0 = f_0 - value - slope * alpha_0;
            let a = (alpha_0 * alpha_0 * r_1 - alpha_1 * alpha_1 * r_0) / denominator;
            let b = (-alpha_0.powi(3) * r_1 + alpha_1.powi(3) * r_0) / denominator;
            let discriminant = b * b - 3.0 * a * slope;
            if a != 0.0 && discriminant >= 0.0 {
                (-b + discriminant.sqrt()) / (3.0 * a)
            } else {
                quadratic()
            }
        }
        _ => quadratic(),
    };

    if !candidate.is_finite() {
        return factor_high * alpha;
    }
    candidate.clamp(factor_low * alpha, factor_high * alpha)
}
