use nalgebra::DVector;

use crate::error::Result;
use crate::optimization::variables::VariableAbstraction;

/// Steepest descent: `d = -g` on the inactive set.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientDescent;

impl GradientDescent {
    pub fn compute_search_direction(
        &self,
        gradient: &DVector<f64>,
        variables: &dyn VariableAbstraction,
    ) -> Result<DVector<f64>> {
        Ok(-variables.restrict_to_inactive_set(gradient)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::control::ControlVariables;

    #[test]
    fn test_direction_is_negative_gradient_off_the_bounds() {
        let mut controls = ControlVariables::new(DVector::from_vec(vec![0.0, 1.0]))
            .with_bounds(DVector::from_vec(vec![-1.0, -1.0]), DVector::from_vec(vec![1.0, 1.0]))
            .unwrap();
        let gradient = DVector::from_vec(vec![2.0, -3.0]);
        controls.compute_active_sets(&gradient).unwrap();
        let direction = GradientDescent
            .compute_search_direction(&gradient, &controls)
            .unwrap();
        assert_eq!(direction.as_slice(), &[-2.0, 0.0]);
    }
}
