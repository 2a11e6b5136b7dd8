//! Typed configuration for the optimization core.
//!
//! The configuration is plain data: it is deserialized once (the CLI reads TOML),
//! validated eagerly with [`Config::validate`], and then passed by reference into
//! every component constructor.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SculptError};
use crate::mesh::quality::{QualityMeasure, QualityReduction};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub optimization: OptimizationConfig,
    pub line_search: LineSearchConfig,
    pub lbfgs: LbfgsConfig,
    pub ncg: NcgConfig,
    pub newton: NewtonConfig,
    pub mesh_quality: MeshQualityConfig,
    pub mesh_constraints: MeshConstraintsConfig,
    pub mesh: MeshConfig,
    pub output: OutputConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[serde(alias = "gd", alias = "gradient_descent")]
    GradientDescent,
    #[serde(alias = "cg", alias = "nonlinear_cg")]
    Ncg,
    #[serde(alias = "bfgs", alias = "lbfgs")]
    Lbfgs,
    Newton,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub algorithm: Algorithm,
    pub rtol: f64,
    pub atol: f64,
    pub maximum_iterations: usize,
    pub soft_exit: bool,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Lbfgs,
            rtol: 1e-3,
            atol: 0.0,
            maximum_iterations: 100,
            soft_exit: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineSearchMethod {
    Armijo,
    Polynomial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolynomialModel {
    Quadratic,
    Cubic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LineSearchConfig {
    pub method: LineSearchMethod,
    pub initial_stepsize: f64,
    pub epsilon_armijo: f64,
    pub beta_armijo: f64,
    pub safeguard_stepsize: bool,
    pub polynomial_model: PolynomialModel,
    pub factor_low: f64,
    pub factor_high: f64,
}

impl Default for LineSearchConfig {
    fn default() -> Self {
        Self {
            method: LineSearchMethod::Armijo,
            initial_stepsize: 1.0,
            epsilon_armijo: 1e-4,
            beta_armijo: 2.0,
            safeguard_stepsize: true,
            polynomial_model: PolynomialModel::Cubic,
            factor_low: 0.1,
            factor_high: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LbfgsConfig {
    pub bfgs_memory_size: usize,
    pub use_bfgs_scaling: bool,
    /// Clear the curvature memory every this many iterations (0 disables).
    pub bfgs_periodic_restart: usize,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            bfgs_memory_size: 5,
            use_bfgs_scaling: true,
            bfgs_periodic_restart: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NcgVariant {
    /// Fletcher-Reeves
    FR,
    /// Polak-Ribiere (non-negative)
    PR,
    /// Hestenes-Stiefel (non-negative)
    HS,
    /// Dai-Yuan
    DY,
    /// Hager-Zhang
    HZ,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct NcgConfig {
    pub cg_method: NcgVariant,
    pub cg_periodic_restart: bool,
    pub cg_periodic_its: usize,
    pub cg_relative_restart: bool,
    pub cg_restart_tol: f64,
}

impl Default for NcgConfig {
    fn default() -> Self {
        Self {
            cg_method: NcgVariant::FR,
            cg_periodic_restart: false,
            cg_periodic_its: 10,
            cg_relative_restart: false,
            cg_restart_tol: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonConfig {
    /// Krylov method used for the inner Newton system (`cg` or `preonly`).
    pub inner_newton: String,
    pub inner_newton_rtol: f64,
    pub inner_newton_atol: f64,
    pub max_it_inner_newton: usize,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        Self {
            inner_newton: "cg".to_string(),
            inner_newton_rtol: 1e-10,
            inner_newton_atol: 0.0,
            max_it_inner_newton: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshQualityConfig {
    /// Bound on the per-cell volume ratio `det(I + ∇V)` accepted a priori.
    pub volume_change: f64,
    /// Bound on the per-cell Frobenius norm of `∇(t·V)` used to pre-shrink steps.
    pub angle_change: f64,
    pub tol_lower: f64,
    pub tol_upper: f64,
    pub measure: QualityMeasure,
    #[serde(rename = "type")]
    pub reduction: QualityReduction,
    /// Remesh every this many iterations (0 disables).
    pub remesh_iter: usize,
}

impl Default for MeshQualityConfig {
    fn default() -> Self {
        Self {
            volume_change: f64::INFINITY,
            angle_change: f64::INFINITY,
            tol_lower: 0.0,
            tol_upper: 1e-15,
            measure: QualityMeasure::Skewness,
            reduction: QualityReduction::Min,
            remesh_iter: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionMode {
    /// Direct solve of `A S⁻¹ Aᵀ λ = h` using the scalar-product matrix `S`.
    Complete,
    /// Iterative solve of `A Aᵀ λ = h`.
    Approximate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConstraintsConfig {
    /// Minimum admissible corner angle in degrees; 0 disables the constraints.
    pub min_angle: f64,
    pub tol: f64,
    pub mode: ProjectionMode,
}

impl Default for MeshConstraintsConfig {
    fn default() -> Self {
        Self {
            min_angle: 0.0,
            tol: 1e-4,
            mode: ProjectionMode::Approximate,
        }
    }
}

impl MeshConstraintsConfig {
    pub fn is_enabled(&self) -> bool {
        self.min_angle > 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub gmsh_file: Option<PathBuf>,
    pub geo_file: Option<PathBuf>,
    pub remesh: bool,
    pub show_gmsh_output: bool,
    pub gmsh_command: String,
    /// Optional converter run as `<command> <input.msh> <output>` after remeshing.
    pub convert_command: Option<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            gmsh_file: None,
            geo_file: None,
            remesh: false,
            show_gmsh_output: false,
            gmsh_command: "gmsh".to_string(),
            convert_command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub verbose: bool,
    pub save_results: bool,
    pub save_txt: bool,
    pub save_mesh: bool,
    pub save_gradient: bool,
    pub result_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            verbose: true,
            save_results: false,
            save_txt: false,
            save_mesh: false,
            save_gradient: false,
            result_dir: PathBuf::from("./results"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Keep the remeshing scratch directories after the run.
    pub remeshing: bool,
}

impl Config {
    /// Rejects inconsistent option combinations before any iteration runs.
    pub fn validate(&self) -> Result<()> {
        let routine = &self.optimization;
        if !(routine.rtol >= 0.0) || !(routine.atol >= 0.0) {
            return Err(SculptError::incompatible(
                "optimization.rtol and optimization.atol must be non-negative",
            ));
        }

        let ls = &self.line_search;
        if !(ls.beta_armijo > 1.0) {
            return Err(SculptError::incompatible(
                "line_search.beta_armijo has to be larger than 1",
            ));
        }
        if !(ls.epsilon_armijo > 0.0 && ls.epsilon_armijo < 1.0) {
            return Err(SculptError::incompatible(
                "line_search.epsilon_armijo has to lie in (0, 1)",
            ));
        }
        if !(ls.initial_stepsize > 0.0) {
            return Err(SculptError::incompatible(
                "line_search.initial_stepsize has to be positive",
            ));
        }
        if !(0.0 < ls.factor_low && ls.factor_low < ls.factor_high && ls.factor_high < 1.0) {
            return Err(SculptError::incompatible(
                "line_search requires 0 < factor_low < factor_high < 1",
            ));
        }

        let quality = &self.mesh_quality;
        if !(quality.tol_lower < quality.tol_upper) {
            return Err(SculptError::incompatible(format!(
                "mesh_quality.tol_lower ({}) has to be strictly smaller than mesh_quality.tol_upper ({})",
                quality.tol_lower, quality.tol_upper
            )));
        }
        if quality.tol_lower > 0.9 * quality.tol_upper {
            warn!(
                "mesh_quality.tol_lower is close to tol_upper; this may slow down the optimization considerably"
            );
        }
        if !(quality.volume_change > 1.0) {
            return Err(SculptError::incompatible(
                "mesh_quality.volume_change has to be larger than 1",
            ));
        }
        if !(quality.angle_change > 0.0) {
            return Err(SculptError::incompatible(
                "mesh_quality.angle_change has to be positive",
            ));
        }

        let constraints = &self.mesh_constraints;
        if !(constraints.min_angle >= 0.0 && constraints.min_angle < 60.0) {
            return Err(SculptError::incompatible(
                "mesh_constraints.min_angle has to lie in [0, 60) degrees",
            ));
        }
        if constraints.is_enabled() && !(constraints.tol > 0.0) {
            return Err(SculptError::incompatible(
                "mesh_constraints.tol has to be positive",
            ));
        }

        if self.mesh.remesh {
            if self.mesh.gmsh_file.is_none() {
                return Err(SculptError::incompatible(
                    "mesh.remesh requires mesh.gmsh_file: remeshing is only available for Gmsh meshes",
                ));
            }
            if self.mesh.geo_file.is_none() {
                return Err(SculptError::incompatible(
                    "mesh.remesh requires mesh.geo_file to regenerate the geometry",
                ));
            }
        }

        if self.optimization.algorithm == Algorithm::Newton
            && !matches!(self.newton.inner_newton.as_str(), "cg" | "preonly")
        {
            return Err(SculptError::incompatible(format!(
                "newton.inner_newton `{}` is not supported (use `cg` or `preonly`)",
                self.newton.inner_newton
            )));
        }

        Ok(())
    }
}
