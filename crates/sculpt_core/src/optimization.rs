//! The outer optimization loop.
//!
//! Every algorithm follows the same iteration: gradient, search direction,
//! ascent guard, line search, convergence test, curvature update. The pieces
//! that differ live in the submodules and are selected through
//! [`SearchDirection`].

pub mod control;
pub mod gradient_descent;
pub mod lbfgs;
pub mod line_search;
pub mod ncg;
pub mod newton;
pub mod shape;
pub mod variables;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{Algorithm, Config};
use crate::error::{Result, SculptError};
use crate::output::OutputManager;
use crate::remesh::{RelaunchRequest, RemeshOrchestrator, RoutineCheckpoint};
use crate::traits::ReducedProblem;

use gradient_descent::GradientDescent;
use lbfgs::LbfgsMethod;
use line_search::LineSearch;
use ncg::NcgMethod;
use newton::NewtonMethod;
use variables::VariableAbstraction;

/// Why an optimization stopped without satisfying the convergence test.
///
/// When several conditions hold after the same iteration, the one checked last
/// (highest in the list below) is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NonConvergenceReason {
    MaxIterations,
    LineSearchBroken,
    /// The mesh quality dropped below `tol_upper`; remeshing is required.
    MeshQualityTooLow,
    /// The iteration budget was already used up when a remeshed run resumed.
    RemeshIterationsExceeded,
}

impl NonConvergenceReason {
    pub fn code(self) -> i32 {
        match self {
            NonConvergenceReason::MaxIterations => -1,
            NonConvergenceReason::LineSearchBroken => -2,
            NonConvergenceReason::MeshQualityTooLow => -3,
            NonConvergenceReason::RemeshIterationsExceeded => -4,
        }
    }
}

impl std::fmt::Display for NonConvergenceReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            NonConvergenceReason::MaxIterations => "Maximum number of iterations were exceeded.",
            NonConvergenceReason::LineSearchBroken => "Failed to compute a feasible Armijo step.",
            NonConvergenceReason::MeshQualityTooLow => "Mesh quality is too low.",
            NonConvergenceReason::RemeshIterationsExceeded => {
                "Maximum number of iterations were exceeded after remeshing."
            }
        };
        f.write_str(message)
    }
}

/// Where the loop currently is; logged at debug level on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmPhase {
    Idle,
    ComputingGradient,
    ComputingDirection,
    LineSearching,
    UpdatingMemory,
    Converged,
    Failed,
}

/// Scalar state of the outer iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationState {
    pub iteration: usize,
    pub objective_value: f64,
    pub gradient_norm: f64,
    pub gradient_norm_initial: f64,
    pub relative_norm: f64,
    pub stepsize: f64,
    pub converged: bool,
    pub reason: Option<NonConvergenceReason>,
    pub has_curvature_info: bool,
    pub line_search_broken: bool,
    pub requires_remeshing: bool,
    pub remeshing_its: bool,
}

impl Default for OptimizationState {
    fn default() -> Self {
        Self {
            iteration: 0,
            objective_value: 1.0,
            gradient_norm: 1.0,
            gradient_norm_initial: 1.0,
            relative_norm: 1.0,
            stepsize: 1.0,
            converged: false,
            reason: None,
            has_curvature_info: false,
            line_search_broken: false,
            requires_remeshing: false,
            remeshing_its: false,
        }
    }
}

impl OptimizationState {
    /// Continues the iteration count and the reference norm of a previous run.
    pub fn restore(&mut self, checkpoint: &RoutineCheckpoint) {
        self.iteration = checkpoint.iteration_counter;
        self.gradient_norm_initial = checkpoint.gradient_norm_initial;
    }

    /// Tests `‖g‖ <= atol + rtol·‖g₀‖` for the current `gradient_norm`.
    ///
    /// At iteration 0 the current norm becomes the reference norm `‖g₀‖`.
    pub fn convergence_test(&mut self, rtol: f64, atol: f64) -> bool {
        if self.iteration == 0 {
            self.gradient_norm_initial = self.gradient_norm;
        }
        self.relative_norm = if self.gradient_norm_initial > 0.0 {
            self.gradient_norm / self.gradient_norm_initial
        } else {
            0.0
        };
        if self.gradient_norm <= atol + rtol * self.gradient_norm_initial {
            self.converged = true;
        }
        self.converged
    }

    /// Sets `reason` from the iteration count and the flags raised by the line
    /// search. Returns whether the loop has to stop.
    pub fn nonconvergence(&mut self, maximum_iterations: usize) -> bool {
        if self.iteration >= maximum_iterations {
            self.reason = Some(NonConvergenceReason::MaxIterations);
        }
        if self.line_search_broken {
            self.reason = Some(NonConvergenceReason::LineSearchBroken);
        }
        if self.requires_remeshing {
            self.reason = Some(NonConvergenceReason::MeshQualityTooLow);
        }
        if self.remeshing_its {
            self.reason = Some(NonConvergenceReason::RemeshIterationsExceeded);
        }
        self.reason.is_some()
    }
}

/// Inputs of a curvature-memory update after an accepted step.
pub struct MemoryUpdate<'a> {
    pub gradient: &'a DVector<f64>,
    pub gradient_prev: &'a DVector<f64>,
    pub direction: &'a DVector<f64>,
    pub stepsize: f64,
    pub iteration: usize,
}

/// The search-direction engines.
pub enum SearchDirection {
    GradientDescent(GradientDescent),
    Ncg(NcgMethod),
    Lbfgs(LbfgsMethod),
    Newton(NewtonMethod),
}

impl SearchDirection {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(match config.optimization.algorithm {
            Algorithm::GradientDescent => SearchDirection::GradientDescent(GradientDescent),
            Algorithm::Ncg => SearchDirection::Ncg(NcgMethod::new(&config.ncg)),
            Algorithm::Lbfgs => SearchDirection::Lbfgs(LbfgsMethod::new(&config.lbfgs)),
            Algorithm::Newton => SearchDirection::Newton(NewtonMethod::new(&config.newton)?),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            SearchDirection::GradientDescent(_) => "gradient descent",
            SearchDirection::Ncg(_) => "nonlinear CG",
            SearchDirection::Lbfgs(_) => "L-BFGS",
            SearchDirection::Newton(_) => "Newton",
        }
    }

    /// Methods whose unit step is meaningful; their line search starts at 1
    /// whenever curvature information is available.
    pub fn is_newton_like(&self) -> bool {
        matches!(self, SearchDirection::Lbfgs(_) | SearchDirection::Newton(_))
    }

    pub fn compute_search_direction(
        &mut self,
        problem: &mut dyn ReducedProblem,
        variables: &dyn VariableAbstraction,
        x: &DVector<f64>,
        gradient: &DVector<f64>,
        iteration: usize,
    ) -> Result<DVector<f64>> {
        match self {
            SearchDirection::GradientDescent(method) => {
                method.compute_search_direction(gradient, variables)
            }
            SearchDirection::Ncg(method) => {
                method.compute_search_direction(gradient, variables, &*problem, iteration)
            }
            SearchDirection::Lbfgs(method) => {
                method.compute_search_direction(gradient, variables, &*problem, iteration)
            }
            SearchDirection::Newton(method) => {
                method.compute_search_direction(problem, variables, x, gradient)
            }
        }
    }

    pub fn update_memory(
        &mut self,
        update: &MemoryUpdate<'_>,
        variables: &dyn VariableAbstraction,
        problem: &dyn ReducedProblem,
    ) -> Result<()> {
        match self {
            SearchDirection::GradientDescent(_) | SearchDirection::Newton(_) => Ok(()),
            SearchDirection::Ncg(method) => {
                method.update_memory(update);
                Ok(())
            }
            SearchDirection::Lbfgs(method) => method.update_memory(update, variables, problem),
        }
    }

    pub fn has_curvature_info(&self) -> bool {
        match self {
            SearchDirection::GradientDescent(_) | SearchDirection::Ncg(_) => false,
            SearchDirection::Lbfgs(method) => method.has_curvature_info(),
            SearchDirection::Newton(method) => method.has_curvature_info(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            SearchDirection::GradientDescent(_) => {}
            SearchDirection::Ncg(method) => method.reset(),
            SearchDirection::Lbfgs(method) => method.reset(),
            SearchDirection::Newton(method) => method.reset(),
        }
    }
}

/// How a run ended when it did not fail hard.
#[derive(Debug)]
pub enum RunOutcome {
    Converged,
    /// Stopped early with `soft_exit` enabled.
    Stopped(NonConvergenceReason),
    /// The mesh was regenerated; the process has to be relaunched.
    Remesh(RelaunchRequest),
}

/// Drives one optimization run over a problem and its variables.
pub struct Optimizer<'a, P: ReducedProblem, V: VariableAbstraction> {
    config: &'a Config,
    problem: &'a mut P,
    variables: &'a mut V,
    output: OutputManager,
    remesher: Option<&'a mut RemeshOrchestrator>,
    direction_engine: SearchDirection,
    line_search: LineSearch,
    state: OptimizationState,
    phase: AlgorithmPhase,
}

impl<'a, P: ReducedProblem, V: VariableAbstraction> Optimizer<'a, P, V> {
    pub fn new(
        config: &'a Config,
        problem: &'a mut P,
        variables: &'a mut V,
        output: OutputManager,
    ) -> Result<Self> {
        config.validate()?;
        let direction_engine = SearchDirection::from_config(config)?;
        let line_search = LineSearch::new(config, direction_engine.is_newton_like());
        info!(
            algorithm = direction_engine.name(),
            dimension = problem.dimension(),
            "initialized optimizer"
        );
        Ok(Self {
            config,
            problem,
            variables,
            output,
            remesher: None,
            direction_engine,
            line_search,
            state: OptimizationState::default(),
            phase: AlgorithmPhase::Idle,
        })
    }

    /// Enables remeshing through `remesher` when the mesh quality degrades.
    pub fn with_remesher(mut self, remesher: &'a mut RemeshOrchestrator) -> Self {
        self.remesher = Some(remesher);
        self
    }

    /// Resumes from the routine section of a remeshing checkpoint.
    pub fn restore(&mut self, checkpoint: &RoutineCheckpoint) {
        self.state.restore(checkpoint);
        info!(
            iteration = self.state.iteration,
            "resuming optimization after remeshing"
        );
    }

    pub fn state(&self) -> &OptimizationState {
        &self.state
    }

    pub fn phase(&self) -> AlgorithmPhase {
        self.phase
    }

    pub fn output(&self) -> &OutputManager {
        &self.output
    }

    fn transition(&mut self, phase: AlgorithmPhase) {
        debug!(from = ?self.phase, to = ?phase, iteration = self.state.iteration, "phase transition");
        self.phase = phase;
    }

    /// Runs the optimization until convergence or a stopping condition.
    ///
    /// Hard failures return [`SculptError::NotConverged`] after the summary and
    /// the result files have been written.
    pub fn run(&mut self) -> Result<RunOutcome> {
        let rtol = self.config.optimization.rtol;
        let atol = self.config.optimization.atol;
        let maximum_iterations = self.config.optimization.maximum_iterations;

        self.transition(AlgorithmPhase::ComputingGradient);
        let mut x = self.variables.current()?;
        let mut gradient = DVector::zeros(x.len());
        self.problem.gradient(&x, &mut gradient)?;
        self.variables.compute_active_sets(&gradient)?;
        self.state.gradient_norm = self.variables.compute_gradient_norm(&gradient, &*self.problem)?;
        if self.state.convergence_test(rtol, atol) {
            self.state.objective_value = self.problem.objective(&x)?;
        }

        let mut objective_known = false;
        while !self.state.converged {
            self.transition(AlgorithmPhase::ComputingDirection);
            let mut direction = self.direction_engine.compute_search_direction(
                &mut *self.problem,
                &*self.variables,
                &x,
                &gradient,
                self.state.iteration,
            )?;
            self.state.has_curvature_info = self.direction_engine.has_curvature_info();
            self.check_for_ascent(&gradient, &mut direction);

            if !objective_known {
                self.state.objective_value = self.problem.objective(&x)?;
            }
            self.record_iteration(&gradient)?;

            self.transition(AlgorithmPhase::LineSearching);
            let has_curvature_info = self.state.has_curvature_info;
            objective_known = self.line_search.perform(
                &mut *self.problem,
                &mut *self.variables,
                &mut self.state,
                &gradient,
                &direction,
                has_curvature_info,
            )?;

            self.state.iteration += 1;
            if self.state.nonconvergence(maximum_iterations) {
                break;
            }

            self.transition(AlgorithmPhase::ComputingGradient);
            let gradient_prev = gradient.clone();
            x = self.variables.current()?;
            self.problem.gradient(&x, &mut gradient)?;
            self.variables.compute_active_sets(&gradient)?;
            self.state.gradient_norm =
                self.variables.compute_gradient_norm(&gradient, &*self.problem)?;
            if self.state.convergence_test(rtol, atol) {
                break;
            }

            self.transition(AlgorithmPhase::UpdatingMemory);
            let update = MemoryUpdate {
                gradient: &gradient,
                gradient_prev: &gradient_prev,
                direction: &direction,
                stepsize: self.state.stepsize,
                iteration: self.state.iteration,
            };
            self.direction_engine
                .update_memory(&update, &*self.variables, &*self.problem)?;
        }

        if self.state.converged {
            self.transition(AlgorithmPhase::Converged);
        } else {
            self.transition(AlgorithmPhase::Failed);
        }
        self.post_processing(&gradient)
    }

    /// Replaces an ascent direction by the negative gradient.
    fn check_for_ascent(&mut self, gradient: &DVector<f64>, direction: &mut DVector<f64>) {
        let directional_derivative = self.problem.scalar_product(gradient, direction);
        if directional_derivative >= 0.0 {
            debug!(
                directional_derivative,
                "search direction is not a descent direction, using the negative gradient"
            );
            *direction = -gradient;
            self.state.has_curvature_info = false;
        }
    }

    fn record_iteration(&mut self, gradient: &DVector<f64>) -> Result<()> {
        let quality = self.variables.mesh_quality();
        self.output.output(&self.state, quality)?;
        if let Some(handler) = self.variables.mesh_handler() {
            let field = handler.deformation_handler().dof_to_coordinate(gradient)?;
            self.output
                .save_snapshot(self.state.iteration, handler.mesh(), &field)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let counts = self.problem.solve_counts();
        self.output.output_summary(&self.state, counts)?;
        self.output
            .post_process(&self.state, counts, self.variables.mesh_handler())?;
        if let Some(remesher) = self.remesher.as_deref() {
            remesher.clear_temp_files()?;
        }
        Ok(())
    }

    fn stop(&self, reason: NonConvergenceReason) -> Result<RunOutcome> {
        if self.config.optimization.soft_exit {
            warn!("{reason}");
            Ok(RunOutcome::Stopped(reason))
        } else {
            error!("{reason}");
            Err(SculptError::NotConverged { reason })
        }
    }

    fn post_processing(&mut self, gradient: &DVector<f64>) -> Result<RunOutcome> {
        match self.state.reason {
            None => {
                self.record_iteration(gradient)?;
                self.finish()?;
                info!(iterations = self.state.iteration, "optimization converged");
                Ok(RunOutcome::Converged)
            }
            Some(NonConvergenceReason::MaxIterations) => {
                self.record_iteration(gradient)?;
                self.finish()?;
                self.stop(NonConvergenceReason::MaxIterations)
            }
            Some(NonConvergenceReason::LineSearchBroken) => {
                self.state.iteration -= 1;
                self.finish()?;
                self.stop(NonConvergenceReason::LineSearchBroken)
            }
            Some(NonConvergenceReason::MeshQualityTooLow) => {
                self.state.iteration -= 1;
                if !(self.config.mesh.remesh && self.remesher.is_some()) {
                    self.finish()?;
                    return self.stop(NonConvergenceReason::MeshQualityTooLow);
                }
                let handler = self.variables.mesh_handler().ok_or_else(|| {
                    SculptError::incompatible("remeshing requires shape variables")
                })?;
                let remesher = self
                    .remesher
                    .as_deref_mut()
                    .ok_or_else(|| SculptError::incompatible("remeshing is not configured"))?;
                let request = remesher.remesh(
                    handler,
                    &self.state,
                    self.output.history(),
                    self.problem.solve_counts(),
                    self.output.result_dir(),
                )?;
                Ok(RunOutcome::Remesh(request))
            }
            Some(NonConvergenceReason::RemeshIterationsExceeded) => {
                self.finish()?;
                self.stop(NonConvergenceReason::RemeshIterationsExceeded)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_problems {
    use nalgebra::DVector;

    use crate::traits::{ReducedProblem, SolveCounts};

    /// `J(x) = ½ Σ wᵢ (xᵢ - aᵢ)²`, with exact Hessian.
    pub struct Quadratic {
        pub target: DVector<f64>,
        pub weights: DVector<f64>,
        pub counts: SolveCounts,
        pub with_hessian: bool,
    }

    impl Quadratic {
        pub fn new(target: Vec<f64>, weights: Vec<f64>) -> Self {
            Self {
                target: DVector::from_vec(target),
                weights: DVector::from_vec(weights),
                counts: SolveCounts::default(),
                with_hessian: true,
            }
        }
    }

    impl ReducedProblem for Quadratic {
        fn dimension(&self) -> usize {
            self.target.len()
        }

        fn objective(&mut self, x: &DVector<f64>) -> anyhow::Result<f64> {
            self.counts.state += 1;
            let r = x - &self.target;
            Ok(0.5 * r.component_mul(&r).dot(&self.weights))
        }

        fn gradient(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> anyhow::Result<()> {
            self.counts.adjoint += 1;
            *out = (x - &self.target).component_mul(&self.weights);
            Ok(())
        }

        fn hessian_action(
            &mut self,
            _x: &DVector<f64>,
            direction: &DVector<f64>,
            out: &mut DVector<f64>,
        ) -> anyhow::Result<bool> {
            if !self.with_hessian {
                return Ok(false);
            }
            *out = direction.component_mul(&self.weights);
            Ok(true)
        }

        fn solve_counts(&self) -> SolveCounts {
            self.counts
        }
    }

    /// Rosenbrock function in two variables.
    pub struct Rosenbrock;

    impl ReducedProblem for Rosenbrock {
        fn dimension(&self) -> usize {
            2
        }

        fn objective(&mut self, x: &DVector<f64>) -> anyhow::Result<f64> {
            Ok((1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2))
        }

        fn gradient(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> anyhow::Result<()> {
            out[0] = -2.0 * (1.0 - x[0]) - 400.0 * x[0] * (x[1] - x[0] * x[0]);
            out[1] = 200.0 * (x[1] - x[0] * x[0]);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::control::ControlVariables;
    use super::shape::ShapeVariables;
    use super::test_problems::{Quadratic, Rosenbrock};
    use super::*;
    use crate::config::{LineSearchMethod, NcgVariant, OutputConfig};
    use crate::mesh::handler::MeshHandler;
    use crate::mesh::{gmsh, regular_mesh};
    use crate::remesh::Checkpoint;
    use crate::traits::{Communicator, SerialCommunicator};
    use approx::assert_relative_eq;

    fn quiet_output(is_shape: bool, constrained: bool) -> OutputManager {
        let config = OutputConfig {
            verbose: false,
            ..OutputConfig::default()
        };
        OutputManager::new(&config, is_shape, constrained, Rc::new(SerialCommunicator))
    }

    #[test]
    fn test_convergence_index_of_norm_sequence() {
        let mut state = OptimizationState::default();
        let norms = [1.0, 0.5, 0.1, 0.001];
        let mut converged_at = None;
        for (iteration, &norm) in norms.iter().enumerate() {
            state.iteration = iteration;
            state.gradient_norm = norm;
            if state.convergence_test(1e-2, 0.0) {
                converged_at = Some(iteration);
                break;
            }
        }
        assert_eq!(converged_at, Some(3));
        assert_relative_eq!(state.relative_norm, 1e-3);
    }

    #[test]
    fn test_zero_initial_gradient_converges_immediately() {
        let mut state = OptimizationState {
            gradient_norm: 0.0,
            ..OptimizationState::default()
        };
        assert!(state.convergence_test(1e-3, 0.0));
        assert_eq!(state.relative_norm, 0.0);
    }

    #[test]
    fn test_restored_initial_norm_is_kept() {
        let mut state = OptimizationState::default();
        state.restore(&RoutineCheckpoint {
            iteration_counter: 7,
            gradient_norm_initial: 4.0,
        });
        state.gradient_norm = 2.0;
        assert!(!state.convergence_test(0.1, 0.0));
        assert_relative_eq!(state.relative_norm, 0.5);
        assert_eq!(state.gradient_norm_initial, 4.0);
    }

    #[test]
    fn test_later_nonconvergence_reason_wins() {
        let mut state = OptimizationState {
            iteration: 10,
            line_search_broken: true,
            ..OptimizationState::default()
        };
        assert!(state.nonconvergence(10));
        assert_eq!(state.reason, Some(NonConvergenceReason::LineSearchBroken));
        assert_eq!(state.reason.map(NonConvergenceReason::code), Some(-2));

        let mut state = OptimizationState::default();
        assert!(!state.nonconvergence(10));
        assert_eq!(state.reason, None);
    }

    fn run_quadratic(config: &Config) -> (RunOutcome, OptimizationState, DVector<f64>) {
        let mut problem = Quadratic::new(vec![1.0, -2.0, 0.5], vec![1.0, 2.0, 3.0]);
        let mut variables = ControlVariables::new(DVector::zeros(3));
        let mut optimizer =
            Optimizer::new(config, &mut problem, &mut variables, quiet_output(false, false)).unwrap();
        let outcome = optimizer.run().unwrap();
        let state = optimizer.state().clone();
        (outcome, state, variables.current().unwrap())
    }

    #[test]
    fn test_every_algorithm_solves_a_quadratic() {
        for algorithm in [
            Algorithm::GradientDescent,
            Algorithm::Ncg,
            Algorithm::Lbfgs,
            Algorithm::Newton,
        ] {
            let mut config = Config::default();
            config.optimization.algorithm = algorithm;
            config.optimization.rtol = 1e-8;
            config.optimization.maximum_iterations = 500;
            let (outcome, state, x) = run_quadratic(&config);
            assert!(matches!(outcome, RunOutcome::Converged), "{algorithm:?}");
            assert!(state.converged);
            assert_relative_eq!(x[0], 1.0, epsilon = 1e-6);
            assert_relative_eq!(x[1], -2.0, epsilon = 1e-6);
            assert_relative_eq!(x[2], 0.5, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_newton_converges_in_one_iteration() {
        let mut config = Config::default();
        config.optimization.algorithm = Algorithm::Newton;
        config.optimization.rtol = 1e-8;
        let (_, state, _) = run_quadratic(&config);
        assert_eq!(state.iteration, 1);
    }

    #[test]
    fn test_ncg_variants_solve_a_quadratic() {
        for variant in [NcgVariant::FR, NcgVariant::PR, NcgVariant::HS, NcgVariant::DY, NcgVariant::HZ] {
            let mut config = Config::default();
            config.optimization.algorithm = Algorithm::Ncg;
            config.optimization.rtol = 1e-8;
            config.optimization.maximum_iterations = 500;
            config.ncg.cg_method = variant;
            config.ncg.cg_relative_restart = true;
            let (outcome, _, x) = run_quadratic(&config);
            assert!(matches!(outcome, RunOutcome::Converged), "{variant:?}");
            assert_relative_eq!(x[1], -2.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_lbfgs_on_rosenbrock() {
        for method in [LineSearchMethod::Armijo, LineSearchMethod::Polynomial] {
            let mut config = Config::default();
            config.optimization.rtol = 1e-6;
            config.optimization.maximum_iterations = 1000;
            config.line_search.method = method;
            let mut problem = Rosenbrock;
            let mut variables = ControlVariables::new(DVector::from_vec(vec![-1.2, 1.0]));
            let mut optimizer =
                Optimizer::new(&config, &mut problem, &mut variables, quiet_output(false, false))
                    .unwrap();
            assert!(matches!(optimizer.run().unwrap(), RunOutcome::Converged), "{method:?}");
            let x = variables.current().unwrap();
            assert_relative_eq!(x[0], 1.0, epsilon = 1e-2);
            assert_relative_eq!(x[1], 1.0, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_max_iterations_is_a_hard_error_after_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.optimization.algorithm = Algorithm::GradientDescent;
        config.optimization.rtol = 1e-12;
        config.optimization.maximum_iterations = 2;
        config.output.verbose = false;
        config.output.save_txt = true;
        config.output.result_dir = dir.path().to_path_buf();

        let mut problem = Rosenbrock;
        let mut variables = ControlVariables::new(DVector::from_vec(vec![-1.2, 1.0]));
        let output = OutputManager::new(&config.output, false, false, Rc::new(SerialCommunicator));
        let mut optimizer = Optimizer::new(&config, &mut problem, &mut variables, output).unwrap();
        let err = optimizer.run().unwrap_err();
        assert!(matches!(
            err,
            SculptError::NotConverged {
                reason: NonConvergenceReason::MaxIterations
            }
        ));
        assert_eq!(optimizer.phase(), AlgorithmPhase::Failed);
        let text = std::fs::read_to_string(dir.path().join("history.txt")).unwrap();
        assert!(text.contains("Statistics"));
        assert!(text.contains("total iterations:    2"));
    }

    #[test]
    fn test_soft_exit_reports_reason() {
        let mut config = Config::default();
        config.optimization.algorithm = Algorithm::GradientDescent;
        config.optimization.rtol = 1e-12;
        config.optimization.maximum_iterations = 3;
        config.optimization.soft_exit = true;
        let mut problem = Rosenbrock;
        let mut variables = ControlVariables::new(DVector::from_vec(vec![-1.2, 1.0]));
        let mut optimizer =
            Optimizer::new(&config, &mut problem, &mut variables, quiet_output(false, false))
                .unwrap();
        let outcome = optimizer.run().unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Stopped(NonConvergenceReason::MaxIterations)
        ));
        assert_eq!(optimizer.output().history().cost_function_value.len(), 4);
    }

    #[test]
    fn test_ascent_guard_keeps_lbfgs_memory() {
        let mut config = Config::default();
        config.optimization.algorithm = Algorithm::Lbfgs;
        let mut problem = Quadratic::new(vec![1.0, -2.0, 0.5], vec![1.0, 2.0, 3.0]);
        let mut variables = ControlVariables::new(DVector::zeros(3));
        let mut optimizer =
            Optimizer::new(&config, &mut problem, &mut variables, quiet_output(false, false)).unwrap();

        let update = MemoryUpdate {
            gradient: &DVector::from_vec(vec![0.0, -2.0, -3.0]),
            gradient_prev: &DVector::from_vec(vec![-1.0, -2.0, -3.0]),
            direction: &DVector::from_vec(vec![1.0, 0.0, 0.0]),
            stepsize: 1.0,
            iteration: 1,
        };
        optimizer
            .direction_engine
            .update_memory(&update, &*optimizer.variables, &*optimizer.problem)
            .unwrap();
        fn memory_len(engine: &SearchDirection) -> usize {
            match engine {
                SearchDirection::Lbfgs(method) => method.memory().len(),
                _ => unreachable!(),
            }
        }
        assert_eq!(memory_len(&optimizer.direction_engine), 1);

        optimizer.state.has_curvature_info = true;
        let gradient = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let mut direction = DVector::from_vec(vec![0.5, 0.0, 1.0]);
        optimizer.check_for_ascent(&gradient, &mut direction);
        assert_eq!(direction, -&gradient);
        assert!(!optimizer.state().has_curvature_info);
        assert_eq!(memory_len(&optimizer.direction_engine), 1);

        let mut descent = -&gradient * 2.0;
        optimizer.state.has_curvature_info = true;
        optimizer.check_for_ascent(&gradient, &mut descent);
        assert_eq!(descent, -&gradient * 2.0);
        assert!(optimizer.state().has_curvature_info);
    }

    #[test]
    fn test_soft_exit_when_resumed_run_has_no_iterations_left() {
        let mut config = Config::default();
        config.optimization.maximum_iterations = 5;
        config.optimization.soft_exit = true;
        let mut problem = Quadratic::new(vec![1.0, -2.0, 0.5], vec![1.0, 2.0, 3.0]);
        let mut variables = ControlVariables::new(DVector::zeros(3));
        let mut optimizer =
            Optimizer::new(&config, &mut problem, &mut variables, quiet_output(false, false)).unwrap();
        optimizer.restore(&RoutineCheckpoint {
            iteration_counter: 5,
            gradient_norm_initial: 10.0,
        });
        let outcome = optimizer.run().unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Stopped(NonConvergenceReason::RemeshIterationsExceeded)
        ));
        assert_eq!(optimizer.phase(), AlgorithmPhase::Failed);
        assert_eq!(variables.current().unwrap(), DVector::zeros(3));
    }

    /// Config and shape variables on a 2×2 square whose quality (0.75) sits just
    /// above `tol_upper`.
    fn degrading_shape(dir: &std::path::Path) -> (Config, ShapeVariables) {
        let mut config = Config::default();
        config.optimization.maximum_iterations = 10;
        config.mesh_quality.tol_upper = 0.74;
        config.output.verbose = false;
        config.output.save_txt = true;
        config.output.result_dir = dir.join("results");
        let comm: Rc<dyn Communicator> = Rc::new(SerialCommunicator);
        let handler = MeshHandler::new(regular_mesh(2, 1.0, 1.0).unwrap(), &config, comm.clone()).unwrap();
        let variables = ShapeVariables::new(handler, &config, comm);
        (config, variables)
    }

    /// Pulls the centre vertex 0.2 to the right.
    fn centre_pull(variables: &ShapeVariables) -> Quadratic {
        let x = variables.current().unwrap();
        let dof_map = variables.mesh_handler().unwrap().deformation_handler().dof_map();
        let mut target: Vec<f64> = x.iter().copied().collect();
        target[dof_map.dof(4, 0)] += 0.2;
        Quadratic::new(target, vec![1.0; x.len()])
    }

    fn shape_output(config: &Config) -> OutputManager {
        OutputManager::new(&config.output, true, false, Rc::new(SerialCommunicator))
    }

    #[test]
    fn test_low_quality_without_remeshing_soft_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, mut variables) = degrading_shape(dir.path());
        config.optimization.soft_exit = true;
        let mut problem = centre_pull(&variables);
        let output = shape_output(&config);
        let mut optimizer = Optimizer::new(&config, &mut problem, &mut variables, output).unwrap();
        let outcome = optimizer.run().unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Stopped(NonConvergenceReason::MeshQualityTooLow)
        ));
        assert_eq!(optimizer.state().iteration, 0);
    }

    #[test]
    fn test_low_quality_without_remeshing_is_a_hard_error_after_summary() {
        let dir = tempfile::tempdir().unwrap();
        let (config, mut variables) = degrading_shape(dir.path());
        let mut problem = centre_pull(&variables);
        let output = shape_output(&config);
        let mut optimizer = Optimizer::new(&config, &mut problem, &mut variables, output).unwrap();
        let err = optimizer.run().unwrap_err();
        assert!(matches!(
            err,
            SculptError::NotConverged {
                reason: NonConvergenceReason::MeshQualityTooLow
            }
        ));
        let text = std::fs::read_to_string(config.output.result_dir.join("history.txt")).unwrap();
        assert!(text.contains("Statistics"));
        assert!(text.contains("total iterations:    0"));
    }

    #[cfg(unix)]
    #[test]
    fn test_low_quality_with_remeshing_requests_relaunch() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let (mut config, mut variables) = degrading_shape(dir.path());
        let generated = dir.path().join("generated.msh");
        gmsh::write_msh(&regular_mesh(3, 1.0, 1.0).unwrap(), &generated).unwrap();
        let fake_gmsh = dir.path().join("fake_gmsh.sh");
        std::fs::write(&fake_gmsh, format!("#!/bin/sh\ncp '{}' \"$4\"\n", generated.display())).unwrap();
        std::fs::set_permissions(&fake_gmsh, std::fs::Permissions::from_mode(0o755)).unwrap();
        let geo = dir.path().join("square.geo");
        std::fs::write(&geo, "Mesh.MeshSizeMax = 0.2;\n").unwrap();
        config.mesh.remesh = true;
        config.mesh.gmsh_file = Some(dir.path().join("square.msh"));
        config.mesh.geo_file = Some(geo);
        config.mesh.gmsh_command = fake_gmsh.to_string_lossy().into_owned();

        let launch = vec!["--config".to_string(), "run.toml".to_string()];
        let mut remesher =
            RemeshOrchestrator::new(&config, "sculpt", launch, Rc::new(SerialCommunicator)).unwrap();
        let mut problem = centre_pull(&variables);
        let output = shape_output(&config);
        let outcome = {
            let mut optimizer = Optimizer::new(&config, &mut problem, &mut variables, output)
                .unwrap()
                .with_remesher(&mut remesher);
            optimizer.run().unwrap()
        };
        let request = match outcome {
            RunOutcome::Remesh(request) => request,
            other => panic!("expected a relaunch request, got {other:?}"),
        };

        let temp_dir = remesher.temp_dir().to_path_buf();
        assert_eq!(request.program, std::path::PathBuf::from("sculpt"));
        assert_eq!(
            request.args,
            vec![
                "--config".to_string(),
                "run.toml".to_string(),
                "--resume".to_string(),
                "--temp-dir".to_string(),
                temp_dir.to_string_lossy().into_owned(),
            ]
        );

        let checkpoint = Checkpoint::load(&temp_dir).unwrap();
        assert_eq!(checkpoint.routine.iteration_counter, 1);
        assert_eq!(checkpoint.remesh_counter, 1);
        assert_eq!(checkpoint.output_dict.history.cost_function_value.len(), 1);
        assert_eq!(checkpoint.output_dict.history.mesh_quality.len(), 1);
        assert_relative_eq!(checkpoint.output_dict.history.mesh_quality[0], 0.75, epsilon = 1e-12);
        assert!(checkpoint.mesh_file.is_file());

        remesher.clear_temp_files().unwrap();
        assert!(!temp_dir.exists());
    }

    #[test]
    fn test_box_constrained_control_stops_at_bound() {
        let mut config = Config::default();
        config.optimization.rtol = 1e-8;
        config.optimization.maximum_iterations = 200;
        let mut problem = Quadratic::new(vec![2.0, -2.0], vec![1.0, 1.0]);
        let mut variables = ControlVariables::new(DVector::zeros(2))
            .with_bounds(DVector::from_vec(vec![-1.0, -1.0]), DVector::from_vec(vec![1.0, 1.0]))
            .unwrap();
        let mut optimizer =
            Optimizer::new(&config, &mut problem, &mut variables, quiet_output(false, true)).unwrap();
        assert!(matches!(optimizer.run().unwrap(), RunOutcome::Converged));
        let x = variables.current().unwrap();
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-8);
        assert_relative_eq!(x[1], -1.0, epsilon = 1e-8);
    }
}
