//! Iteration history, console/text reports and result files.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::OutputConfig;
use crate::error::Result;
use crate::mesh::handler::MeshHandler;
use crate::mesh::Mesh;
use crate::optimization::OptimizationState;
use crate::traits::{Communicator, SolveCounts};

/// Per-iteration series; carried across remeshing restarts in the checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub cost_function_value: Vec<f64>,
    /// Relative gradient norm (or stationarity measure).
    pub gradient_norm: Vec<f64>,
    pub stepsize: Vec<f64>,
    #[serde(rename = "MeshQuality", default)]
    pub mesh_quality: Vec<f64>,
}

/// Contents of `history.json`.
#[derive(Debug, Serialize)]
struct ResultsRecord<'a> {
    #[serde(flatten)]
    history: &'a History,
    initial_gradient_norm: f64,
    state_solves: usize,
    adjoint_solves: usize,
    iterations: usize,
}

/// One row of the iteration table, preceded by the header every 10 iterations.
pub fn generate_output_str(state: &OptimizationState, mesh_quality: Option<f64>, constrained: bool) -> String {
    let label = if constrained { "stat. meas." } else { "grad. norm" };
    let width = label.len() + 5;
    let iteration = state.iteration;

    let mut line = String::new();
    if iteration % 10 == 0 {
        line.push_str(&format!("\niter,  cost function,  rel. {label},  abs. {label},  "));
        if mesh_quality.is_some() {
            line.push_str("mesh qlty,  ");
        }
        line.push_str("step size\n\n");
    }
    line.push_str(&format!(
        "{iteration:4},  {:>13.3e},  {:>width$.3e},  {:>width$.3e},  ",
        state.objective_value, state.relative_norm, state.gradient_norm
    ));
    if let Some(quality) = mesh_quality {
        line.push_str(&format!("{quality:>9.2},  "));
    }
    if iteration > 0 {
        line.push_str(&format!("{:>9.3e}", state.stepsize));
    } else {
        line.push('\n');
    }
    line.push('\n');
    line
}

pub fn generate_summary_str(state: &OptimizationState, counts: SolveCounts) -> String {
    let headline = if state.converged {
        "Optimization was successful."
    } else {
        "Optimization was stopped."
    };
    format!(
        "\n{headline}\nStatistics:\n    total iterations: {:4}\n    final objective value: {:>10.3e}\n    final gradient norm:   {:>10.3e}\n    total number of state systems solved:   {:4}\n    total number of adjoint systems solved: {:4}\n",
        state.iteration, state.objective_value, state.relative_norm, counts.state, counts.adjoint
    )
}

/// Writes a mesh with an optional per-vertex vector field as legacy ASCII VTK.
pub fn write_vtk(mesh: &Mesh, field: Option<(&str, &[f64])>, path: &Path) -> Result<()> {
    let dim = mesh.dim();
    let mut out = String::new();
    out.push_str("# vtk DataFile Version 3.0\nsculpt\nASCII\nDATASET UNSTRUCTURED_GRID\n");
    out.push_str(&format!("POINTS {} double\n", mesh.num_vertices()));
    for v in 0..mesh.num_vertices() {
        let p = mesh.vertex(v);
        let z = if dim == 3 { p[2] } else { 0.0 };
        out.push_str(&format!("{} {} {}\n", p[0], p[1], z));
    }
    let per_cell = mesh.vertices_per_cell();
    out.push_str(&format!(
        "CELLS {} {}\n",
        mesh.num_cells(),
        mesh.num_cells() * (per_cell + 1)
    ));
    for c in 0..mesh.num_cells() {
        let ids: Vec<String> = mesh.cell(c).iter().map(|v| v.to_string()).collect();
        out.push_str(&format!("{per_cell} {}\n", ids.join(" ")));
    }
    // 5 = VTK_TRIANGLE, 10 = VTK_TETRA
    let cell_type = if dim == 2 { 5 } else { 10 };
    out.push_str(&format!("CELL_TYPES {}\n", mesh.num_cells()));
    for _ in 0..mesh.num_cells() {
        out.push_str(&format!("{cell_type}\n"));
    }
    if let Some((name, values)) = field {
        out.push_str(&format!("POINT_DATA {}\nVECTORS {name} double\n", mesh.num_vertices()));
        for v in values.chunks(dim) {
            let z = if dim == 3 { v[2] } else { 0.0 };
            out.push_str(&format!("{} {} {}\n", v[0], v[1], z));
        }
    }
    fs::write(path, out)?;
    Ok(())
}

/// Collects the history and writes every report the configuration asks for.
///
/// Files are only written on the root rank.
pub struct OutputManager {
    config: OutputConfig,
    history: History,
    is_shape: bool,
    constrained: bool,
    comm: Rc<dyn Communicator>,
}

impl OutputManager {
    pub fn new(config: &OutputConfig, is_shape: bool, constrained: bool, comm: Rc<dyn Communicator>) -> Self {
        Self {
            config: config.clone(),
            history: History::default(),
            is_shape,
            constrained,
            comm,
        }
    }

    /// Continues the series of a previous run.
    pub fn with_history(mut self, history: History) -> Self {
        self.history = history;
        self
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn result_dir(&self) -> &Path {
        &self.config.result_dir
    }

    fn ensure_result_dir(&self) -> Result<()> {
        if self.comm.is_root() {
            fs::create_dir_all(&self.config.result_dir)?;
        }
        Ok(())
    }

    fn history_txt(&self) -> PathBuf {
        self.config.result_dir.join("history.txt")
    }

    /// Records the current iteration and prints/writes its table row.
    pub fn output(&mut self, state: &OptimizationState, mesh_quality: Option<f64>) -> Result<()> {
        self.history.cost_function_value.push(state.objective_value);
        self.history.gradient_norm.push(state.relative_norm);
        self.history.stepsize.push(state.stepsize);
        if let Some(quality) = mesh_quality {
            self.history.mesh_quality.push(quality);
        }

        let row = generate_output_str(state, mesh_quality.filter(|_| self.is_shape), self.constrained);
        if !self.comm.is_root() {
            return Ok(());
        }
        if self.config.verbose {
            print!("{row}");
        }
        if self.config.save_txt {
            self.ensure_result_dir()?;
            let mut file = if state.iteration == 0 {
                File::create(self.history_txt())?
            } else {
                OpenOptions::new().create(true).append(true).open(self.history_txt())?
            };
            file.write_all(row.as_bytes())?;
        }
        Ok(())
    }

    pub fn output_summary(&self, state: &OptimizationState, counts: SolveCounts) -> Result<()> {
        if !self.comm.is_root() {
            return Ok(());
        }
        let summary = generate_summary_str(state, counts);
        if self.config.verbose {
            println!("{summary}");
        }
        if self.config.save_txt {
            self.ensure_result_dir()?;
            let mut file = OpenOptions::new().create(true).append(true).open(self.history_txt())?;
            file.write_all(summary.as_bytes())?;
        }
        Ok(())
    }

    /// VTK snapshot of the mesh and the gradient field of one iteration.
    pub fn save_snapshot(&self, iteration: usize, mesh: &Mesh, gradient: &[f64]) -> Result<()> {
        if !(self.config.save_mesh || self.config.save_gradient) || !self.comm.is_root() {
            return Ok(());
        }
        let dir = self.config.result_dir.join("vtk");
        fs::create_dir_all(&dir)?;
        let field = self.config.save_gradient.then_some(("gradient", gradient));
        let path = dir.join(format!("iteration_{iteration:04}.vtk"));
        write_vtk(mesh, field, &path)?;
        debug!(path = %path.display(), "wrote snapshot");
        Ok(())
    }

    /// Final result files: `history.json` and `optimized_mesh.msh`.
    pub fn post_process(
        &self,
        state: &OptimizationState,
        counts: SolveCounts,
        mesh_handler: Option<&MeshHandler>,
    ) -> Result<()> {
        if self.comm.is_root() {
            if self.config.save_results {
                self.ensure_result_dir()?;
                let record = ResultsRecord {
                    history: &self.history,
                    initial_gradient_norm: state.gradient_norm_initial,
                    state_solves: counts.state,
                    adjoint_solves: counts.adjoint,
                    iterations: state.iteration,
                };
                let path = self.config.result_dir.join("history.json");
                fs::write(&path, serde_json::to_string_pretty(&record)?)?;
                info!(path = %path.display(), "saved optimization history");
            }
            if let (true, Some(handler)) = (self.config.save_mesh, mesh_handler) {
                self.ensure_result_dir()?;
                let path = self.config.result_dir.join("optimized_mesh.msh");
                handler.write_mesh(&path)?;
                info!(path = %path.display(), "saved optimized mesh");
            }
        }
        self.comm.barrier();
        Ok(())
    }
}
