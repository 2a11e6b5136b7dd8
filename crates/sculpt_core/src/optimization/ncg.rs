//! Nonlinear conjugate gradient directions.

use nalgebra::DVector;
use tracing::debug;

use crate::config::{NcgConfig, NcgVariant};
use crate::error::Result;
use crate::optimization::variables::VariableAbstraction;
use crate::optimization::MemoryUpdate;
use crate::traits::ReducedProblem;

/// `d = -g + β d_prev` with the update rule of the configured variant.
#[derive(Debug, Clone)]
pub struct NcgMethod {
    variant: NcgVariant,
    periodic_restart: bool,
    periodic_its: usize,
    relative_restart: bool,
    restart_tol: f64,
    gradient_prev: Option<DVector<f64>>,
    direction_prev: Option<DVector<f64>>,
}

impl NcgMethod {
    pub fn new(config: &NcgConfig) -> Self {
        Self {
            variant: config.cg_method,
            periodic_restart: config.cg_periodic_restart,
            periodic_its: config.cg_periodic_its,
            relative_restart: config.cg_relative_restart,
            restart_tol: config.cg_restart_tol,
            gradient_prev: None,
            direction_prev: None,
        }
    }

    pub fn reset(&mut self) {
        self.gradient_prev = None;
        self.direction_prev = None;
    }

    /// Stores the gradient and direction of the step just taken.
    pub fn update_memory(&mut self, update: &MemoryUpdate<'_>) {
        self.gradient_prev = Some(update.gradient_prev.clone());
        self.direction_prev = Some(update.direction.clone());
    }

    fn restart_required(
        &self,
        gradient: &DVector<f64>,
        gradient_prev: &DVector<f64>,
        problem: &dyn ReducedProblem,
        iteration: usize,
    ) -> bool {
        if self.periodic_restart && self.periodic_its > 0 && iteration % self.periodic_its == 0 {
            return true;
        }
        if self.relative_restart {
            let gg = problem.scalar_product(gradient, gradient);
            let overlap = problem.scalar_product(gradient, gradient_prev).abs();
            if gg > 0.0 && overlap / gg >= self.restart_tol {
                return true;
            }
        }
        false
    }

    pub fn compute_search_direction(
        &mut self,
        gradient: &DVector<f64>,
        variables: &dyn VariableAbstraction,
        problem: &dyn ReducedProblem,
        iteration: usize,
    ) -> Result<DVector<f64>> {
        let g = variables.restrict_to_inactive_set(gradient)?;
        let (gradient_prev, direction_prev) = match (&self.gradient_prev, &self.direction_prev) {
            (Some(gp), Some(dp)) if iteration > 0 => (
                variables.restrict_to_inactive_set(gp)?,
                variables.restrict_to_inactive_set(dp)?,
            ),
            _ => return Ok(-g),
        };
        if self.restart_required(&g, &gradient_prev, problem, iteration) {
            debug!(iteration, "restarting nonlinear CG");
            return Ok(-g);
        }

        let beta = ncg_beta(self.variant, &g, &gradient_prev, &direction_prev, problem);
        let mut direction = -g;
        direction.axpy(beta, &direction_prev, 1.0);
        variables.restrict_to_inactive_set(&direction)
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 || !denominator.is_finite() {
        0.0
    } else {
        numerator / denominator
    }
}

/// The CG update parameter; PR and HS are clipped at zero.
pub fn ncg_beta(
    variant: NcgVariant,
    gradient: &DVector<f64>,
    gradient_prev: &DVector<f64>,
    direction_prev: &DVector<f64>,
    problem: &dyn ReducedProblem,
) -> f64 {
    let sp = |a: &DVector<f64>, b: &DVector<f64>| problem.scalar_product(a, b);
    let y = gradient - gradient_prev;
    match variant {
        NcgVariant::FR => ratio(sp(gradient, gradient), sp(gradient_prev, gradient_prev)),
        NcgVariant::PR => ratio(sp(gradient, &y), sp(gradient_prev, gradient_prev)).max(0.0),
        NcgVariant::HS => ratio(sp(gradient, &y), sp(direction_prev, &y)).max(0.0),
        NcgVariant::DY => ratio(sp(gradient, gradient), sp(direction_prev, &y)),
        NcgVariant::HZ => {
            let dy = sp(direction_prev, &y);
            if dy == 0.0 {
                return 0.0;
            }
            let correction = direction_prev * (2.0 * sp(&y, &y) / dy);
            sp(&(&y - correction), gradient) / dy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::control::ControlVariables;
    use crate::optimization::test_problems::Quadratic;
    use approx::assert_relative_eq;

    fn vectors() -> (DVector<f64>, DVector<f64>, DVector<f64>) {
        (
            DVector::from_vec(vec![1.0, 2.0]),
            DVector::from_vec(vec![2.0, 0.0]),
            DVector::from_vec(vec![-2.0, 0.0]),
        )
    }

    #[test]
    fn test_beta_formulas() {
        let problem = Quadratic::new(vec![0.0; 2], vec![1.0; 2]);
        let (g, gp, dp) = vectors();
        // y = (-1, 2), gᵀg = 5, gpᵀgp = 4, gᵀy = 3, dpᵀy = 2, yᵀy = 5
        assert_relative_eq!(ncg_beta(NcgVariant::FR, &g, &gp, &dp, &problem), 1.25);
        assert_relative_eq!(ncg_beta(NcgVariant::PR, &g, &gp, &dp, &problem), 0.75);
        assert_relative_eq!(ncg_beta(NcgVariant::HS, &g, &gp, &dp, &problem), 1.5);
        assert_relative_eq!(ncg_beta(NcgVariant::DY, &g, &gp, &dp, &problem), 2.5);
        // (y - 2 dp · 5/2)ᵀ g / 2 = ((9, 2)ᵀ(1, 2)) / 2
        assert_relative_eq!(ncg_beta(NcgVariant::HZ, &g, &gp, &dp, &problem), 6.5);
    }

    #[test]
    fn test_pr_is_clipped_at_zero() {
        let problem = Quadratic::new(vec![0.0; 2], vec![1.0; 2]);
        let g = DVector::from_vec(vec![1.0, 0.0]);
        let gp = DVector::from_vec(vec![3.0, 0.0]);
        let dp = DVector::from_vec(vec![-3.0, 0.0]);
        assert_eq!(ncg_beta(NcgVariant::PR, &g, &gp, &dp, &problem), 0.0);
    }

    #[test]
    fn test_relative_restart_falls_back_to_gradient() {
        let config = NcgConfig {
            cg_relative_restart: true,
            cg_restart_tol: 0.25,
            ..NcgConfig::default()
        };
        let mut method = NcgMethod::new(&config);
        let problem = Quadratic::new(vec![0.0; 2], vec![1.0; 2]);
        let controls = ControlVariables::new(DVector::zeros(2));
        let (g, gp, dp) = vectors();
        method.update_memory(&MemoryUpdate {
            gradient: &g,
            gradient_prev: &gp,
            direction: &dp,
            stepsize: 1.0,
            iteration: 1,
        });
        // |gᵀgp| / gᵀg = 2/5 >= 0.25
        let direction = method
            .compute_search_direction(&g, &controls, &problem, 1)
            .unwrap();
        assert_eq!(direction, -g.clone());

        method.reset();
        let direction = method
            .compute_search_direction(&g, &controls, &problem, 1)
            .unwrap();
        assert_eq!(direction, -g);
    }

    #[test]
    fn test_fletcher_reeves_direction() {
        let mut method = NcgMethod::new(&NcgConfig::default());
        let problem = Quadratic::new(vec![0.0; 2], vec![1.0; 2]);
        let controls = ControlVariables::new(DVector::zeros(2));
        let (g, gp, dp) = vectors();
        method.update_memory(&MemoryUpdate {
            gradient: &g,
            gradient_prev: &gp,
            direction: &dp,
            stepsize: 1.0,
            iteration: 1,
        });
        let direction = method
            .compute_search_direction(&g, &controls, &problem, 1)
            .unwrap();
        assert_relative_eq!(direction[0], -1.0 - 1.25 * 2.0);
        assert_relative_eq!(direction[1], -2.0);
    }
}
