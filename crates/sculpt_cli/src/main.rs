//! `sculpt`: runs a shape optimization from a TOML configuration.
//!
//! Without `mesh.gmsh_file` the unit square is triangulated. A run that
//! remeshes replaces itself with `sculpt ... --resume --temp-dir <dir>`, which
//! picks the optimization up from the checkpoint on the new mesh.

mod problem;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sculpt_core::mesh::gmsh::read_msh;
use sculpt_core::mesh::handler::MeshHandler;
use sculpt_core::mesh::{regular_mesh, Mesh};
use sculpt_core::optimization::shape::ShapeVariables;
use sculpt_core::optimization::variables::VariableAbstraction;
use sculpt_core::output::OutputManager;
use sculpt_core::remesh::{Checkpoint, RelaunchRequest, RemeshOrchestrator};
use sculpt_core::{Communicator, Config, Optimizer, RunOutcome, SerialCommunicator};

use problem::DiskProblem;

#[derive(Parser, Debug)]
#[command(name = "sculpt", version, about = "Mesh-preserving shape optimization")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,
    /// Resume from the checkpoint in `--temp-dir` after remeshing.
    #[arg(long, requires = "temp_dir")]
    resume: bool,
    #[arg(long)]
    temp_dir: Option<PathBuf>,
    /// Subdivisions per side of the default unit-square mesh.
    #[arg(long, default_value_t = 16)]
    resolution: usize,
    /// Target disk radius.
    #[arg(long, default_value_t = 0.35)]
    radius: f64,
    /// Target disk center, comma separated.
    #[arg(long, value_delimiter = ',', default_value = "0.5,0.5")]
    center: Vec<f64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
    run(Cli::parse())
}

fn load_config(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// The mesh to optimize and, for Gmsh meshes, the file and node tags it came from.
fn load_mesh(
    config: &Config,
    checkpoint: Option<&Checkpoint>,
    resolution: usize,
) -> Result<(Mesh, Option<(PathBuf, Vec<usize>)>)> {
    if let Some(checkpoint) = checkpoint {
        let imported = read_msh(&checkpoint.mesh_file)
            .with_context(|| format!("failed to import {}", checkpoint.mesh_file.display()))?;
        return Ok((imported.mesh, Some((checkpoint.gmsh_file.clone(), imported.node_tags))));
    }
    match &config.mesh.gmsh_file {
        Some(path) => {
            let imported =
                read_msh(path).with_context(|| format!("failed to import {}", path.display()))?;
            Ok((imported.mesh, Some((path.clone(), imported.node_tags))))
        }
        None => Ok((regular_mesh(resolution, 1.0, 1.0)?, None)),
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    let comm: Rc<dyn Communicator> = Rc::new(SerialCommunicator);

    let checkpoint = match (cli.resume, &cli.temp_dir) {
        (true, Some(dir)) => Some(
            Checkpoint::load(dir)
                .with_context(|| format!("failed to load the checkpoint in {}", dir.display()))?,
        ),
        (true, None) => bail!("--resume requires --temp-dir"),
        (false, _) => None,
    };

    let (mesh, gmsh_source) = load_mesh(&config, checkpoint.as_ref(), cli.resolution)?;
    info!(
        vertices = mesh.num_vertices(),
        cells = mesh.num_cells(),
        dim = mesh.dim(),
        "imported mesh"
    );
    let mut handler = MeshHandler::new(mesh, &config, comm.clone())?;
    if let Some((path, node_tags)) = gmsh_source {
        handler = handler.with_gmsh_source(path, node_tags);
    }
    if checkpoint.is_some() {
        handler.check_remeshed_quality()?;
    }

    let mut problem = DiskProblem::new(
        handler.mesh(),
        handler.deformation_handler().dof_map(),
        cli.center,
        cli.radius,
    )?;
    let mut output_config = config.output.clone();
    if let Some(checkpoint) = &checkpoint {
        problem = problem.with_solve_counts(checkpoint.output_dict.solve_counts());
        output_config.result_dir = checkpoint.result_dir.clone();
    }

    let mut variables = ShapeVariables::new(handler, &config, comm.clone());
    let mut output = OutputManager::new(&output_config, true, variables.is_constrained(), comm.clone());
    if let Some(checkpoint) = &checkpoint {
        output = output.with_history(checkpoint.output_dict.history.clone());
    }

    let mut remesher = if config.mesh.remesh {
        let program = std::env::current_exe().context("cannot locate the running executable")?;
        let args: Vec<String> = std::env::args().skip(1).collect();
        Some(match &checkpoint {
            Some(checkpoint) => RemeshOrchestrator::resume(&config, checkpoint, program, args, comm.clone())?,
            None => RemeshOrchestrator::new(&config, program, args, comm.clone())?,
        })
    } else {
        None
    };

    let mut optimizer = Optimizer::new(&config, &mut problem, &mut variables, output)?;
    if let Some(remesher) = remesher.as_mut() {
        optimizer = optimizer.with_remesher(remesher);
    }
    if let Some(checkpoint) = &checkpoint {
        optimizer.restore(&checkpoint.routine);
    }

    match optimizer.run()? {
        RunOutcome::Converged => {
            info!(iterations = optimizer.state().iteration, "done");
            Ok(())
        }
        RunOutcome::Stopped(reason) => {
            warn!(%reason, "optimization stopped early");
            Ok(())
        }
        RunOutcome::Remesh(request) => relaunch(request),
    }
}

/// Replaces the current process; only returns on failure.
#[cfg(unix)]
fn relaunch(request: RelaunchRequest) -> Result<()> {
    use std::os::unix::process::CommandExt;

    info!(program = %request.program.display(), args = ?request.args, "relaunching on the new mesh");
    let err = Command::new(&request.program).args(&request.args).exec();
    Err(err).with_context(|| format!("failed to relaunch {}", request.program.display()))
}

#[cfg(not(unix))]
fn relaunch(request: RelaunchRequest) -> Result<()> {
    info!(program = %request.program.display(), args = ?request.args, "relaunching on the new mesh");
    let status = Command::new(&request.program)
        .args(&request.args)
        .status()
        .with_context(|| format!("failed to relaunch {}", request.program.display()))?;
    if !status.success() {
        bail!("relaunched optimization exited with {status}");
    }
    Ok(())
}
