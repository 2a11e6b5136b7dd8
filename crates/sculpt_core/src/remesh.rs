//! Remeshing with Gmsh and the checkpoint that carries an optimization across
//! the process restart.
//!
//! Remeshing changes the number of degrees of freedom, so the run cannot go on
//! in-process. Instead the current mesh is exported, Gmsh builds a new mesh from
//! it, the optimization state is written to `temp_dict.json` and the caller
//! receives a [`RelaunchRequest`] that restarts the program with `--resume`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Result, SculptError};
use crate::mesh::gmsh;
use crate::mesh::handler::MeshHandler;
use crate::optimization::OptimizationState;
use crate::output::History;
use crate::traits::{Communicator, SolveCounts};

pub const CHECKPOINT_FILE: &str = "temp_dict.json";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutineCheckpoint {
    /// Iteration the resumed run starts at.
    pub iteration_counter: usize,
    pub gradient_norm_initial: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputCheckpoint {
    #[serde(flatten)]
    pub history: History,
    pub iterations: usize,
    pub state_solves: usize,
    pub adjoint_solves: usize,
}

impl OutputCheckpoint {
    pub fn solve_counts(&self) -> SolveCounts {
        SolveCounts {
            state: self.state_solves,
            adjoint: self.adjoint_solves,
        }
    }
}

/// Everything a resumed run needs, stored as `temp_dir/temp_dict.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Mesh the resumed run imports.
    pub mesh_file: PathBuf,
    /// Gmsh file the next remeshing exports through.
    pub gmsh_file: PathBuf,
    pub geo_file: PathBuf,
    pub remesh_counter: usize,
    pub remesh_directory: PathBuf,
    pub result_dir: PathBuf,
    pub temp_dir: PathBuf,
    #[serde(rename = "OptimizationRoutine")]
    pub routine: RoutineCheckpoint,
    pub output_dict: OutputCheckpoint,
}

impl Checkpoint {
    pub fn path(temp_dir: &Path) -> PathBuf {
        temp_dir.join(CHECKPOINT_FILE)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::path(&self.temp_dir);
        fs::write(&path, serde_json::to_string(self)?)?;
        debug!(path = %path.display(), "wrote remeshing checkpoint");
        Ok(())
    }

    pub fn load(temp_dir: &Path) -> Result<Self> {
        let text = fs::read_to_string(Self::path(temp_dir))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Program and arguments the process has to be replaced with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaunchRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Removes a previous `--resume` and `--temp-dir <dir>` from `args` and
/// appends fresh ones pointing at `temp_dir`.
///
/// Each flag may appear at most once in `args`.
pub fn relaunch_arguments(args: &[String], temp_dir: &Path) -> Result<Vec<String>> {
    let duplicate = |flag: &str| {
        SculptError::invalid_input(
            "command line options",
            format!("the {flag} flag should only be present once"),
        )
    };

    let mut filtered = Vec::with_capacity(args.len() + 3);
    let mut resume_seen = false;
    let mut temp_dir_seen = false;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--resume" => {
                if resume_seen {
                    return Err(duplicate("--resume"));
                }
                resume_seen = true;
            }
            "--temp-dir" => {
                if temp_dir_seen {
                    return Err(duplicate("--temp-dir"));
                }
                temp_dir_seen = true;
                iter.next();
            }
            flag if flag.starts_with("--temp-dir=") => {
                if temp_dir_seen {
                    return Err(duplicate("--temp-dir"));
                }
                temp_dir_seen = true;
            }
            _ => filtered.push(arg.clone()),
        }
    }

    filtered.push("--resume".to_string());
    filtered.push("--temp-dir".to_string());
    filtered.push(temp_dir.to_string_lossy().into_owned());
    Ok(filtered)
}

/// Owns the scratch directories of the remeshing epochs and runs Gmsh.
pub struct RemeshOrchestrator {
    gmsh_command: String,
    convert_command: Option<String>,
    show_gmsh_output: bool,
    keep_files: bool,
    geo_file: PathBuf,
    temp_dir: PathBuf,
    remesh_directory: PathBuf,
    remesh_counter: usize,
    program: PathBuf,
    args: Vec<String>,
    comm: Rc<dyn Communicator>,
}

impl RemeshOrchestrator {
    /// Sets up a fresh run: creates the temporary directory for the checkpoint
    /// and the remeshing directory next to the Gmsh file.
    ///
    /// `args` are the command line arguments without the program name.
    pub fn new(
        config: &Config,
        program: impl Into<PathBuf>,
        args: Vec<String>,
        comm: Rc<dyn Communicator>,
    ) -> Result<Self> {
        let (gmsh_file, geo_file) = match (&config.mesh.gmsh_file, &config.mesh.geo_file) {
            (Some(gmsh_file), Some(geo_file)) => (gmsh_file, geo_file.clone()),
            _ => {
                return Err(SculptError::incompatible(
                    "remeshing requires mesh.gmsh_file and mesh.geo_file",
                ))
            }
        };
        let mesh_directory = gmsh_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let temp_dir = tempfile::Builder::new().prefix("sculpt_").tempdir()?.keep();
        let remesh_directory = tempfile::Builder::new()
            .prefix("sculpt_remesh_")
            .tempdir_in(mesh_directory)?
            .keep();
        info!(
            temp_dir = %temp_dir.display(),
            remesh_directory = %remesh_directory.display(),
            "remeshing enabled"
        );

        Ok(Self::with_directories(config, geo_file, temp_dir, remesh_directory, 0, program, args, comm))
    }

    /// Continues the remeshing epochs recorded in `checkpoint`.
    pub fn resume(
        config: &Config,
        checkpoint: &Checkpoint,
        program: impl Into<PathBuf>,
        args: Vec<String>,
        comm: Rc<dyn Communicator>,
    ) -> Result<Self> {
        if !checkpoint.remesh_directory.is_dir() {
            fs::create_dir_all(&checkpoint.remesh_directory)?;
        }
        Ok(Self::with_directories(
            config,
            checkpoint.geo_file.clone(),
            checkpoint.temp_dir.clone(),
            checkpoint.remesh_directory.clone(),
            checkpoint.remesh_counter,
            program,
            args,
            comm,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn with_directories(
        config: &Config,
        geo_file: PathBuf,
        temp_dir: PathBuf,
        remesh_directory: PathBuf,
        remesh_counter: usize,
        program: impl Into<PathBuf>,
        args: Vec<String>,
        comm: Rc<dyn Communicator>,
    ) -> Self {
        Self {
            gmsh_command: config.mesh.gmsh_command.clone(),
            convert_command: config.mesh.convert_command.clone(),
            show_gmsh_output: config.mesh.show_gmsh_output,
            keep_files: config.debug.remeshing,
            geo_file,
            temp_dir,
            remesh_directory,
            remesh_counter,
            program: program.into(),
            args,
            comm,
        }
    }

    pub fn remesh_counter(&self) -> usize {
        self.remesh_counter
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn remesh_directory(&self) -> &Path {
        &self.remesh_directory
    }

    fn epoch_file(&self, counter: usize, suffix: &str) -> PathBuf {
        self.remesh_directory.join(format!("mesh_{counter}{suffix}"))
    }

    fn run(&self, command: &mut Command, quiet: bool) -> Result<()> {
        if quiet {
            command.stdout(Stdio::null());
        }
        let description = format!("{command:?}");
        debug!(command = %description, "running external tool");
        let status = command.status()?;
        if !status.success() {
            return Err(SculptError::external_tool(description, status));
        }
        Ok(())
    }

    /// Generates a new mesh from the current one and writes the checkpoint.
    ///
    /// Returns the command line the process has to be relaunched with.
    pub fn remesh(
        &mut self,
        mesh_handler: &MeshHandler,
        state: &OptimizationState,
        history: &History,
        counts: SolveCounts,
        result_dir: &Path,
    ) -> Result<RelaunchRequest> {
        self.remesh_counter += 1;
        let counter = self.remesh_counter;
        info!(counter, iteration = state.iteration, "remeshing");

        let pre_remesh = self.epoch_file(counter, "_pre_remesh.msh");
        let new_gmsh_file = self.epoch_file(counter, ".msh");
        let mut mesh_file = new_gmsh_file.clone();

        if self.comm.is_root() {
            mesh_handler.write_mesh(&pre_remesh)?;
            let remesh_geo = self.remesh_directory.join("remesh.geo");
            gmsh::generate_remesh_geo(&self.geo_file, &pre_remesh, &remesh_geo)?;

            let dim = mesh_handler.mesh().dim();
            let mut gmsh_cmd = Command::new(&self.gmsh_command);
            gmsh_cmd
                .arg(&remesh_geo)
                .arg(format!("-{dim}"))
                .arg("-o")
                .arg(&new_gmsh_file)
                .arg("-format")
                .arg("msh22");
            self.run(&mut gmsh_cmd, !self.show_gmsh_output)?;
            gmsh::remove_gmsh_parametrizations(&new_gmsh_file)?;

            if let Some(convert) = &self.convert_command {
                mesh_file = self.epoch_file(counter, "_converted.msh");
                let mut convert_cmd = Command::new(convert);
                convert_cmd.arg(&new_gmsh_file).arg(&mesh_file);
                self.run(&mut convert_cmd, false)?;
            }

            self.clean_previous_files()?;

            let checkpoint = Checkpoint {
                mesh_file,
                gmsh_file: new_gmsh_file,
                geo_file: self.geo_file.clone(),
                remesh_counter: counter,
                remesh_directory: self.remesh_directory.clone(),
                result_dir: result_dir.to_path_buf(),
                temp_dir: self.temp_dir.clone(),
                routine: RoutineCheckpoint {
                    iteration_counter: state.iteration + 1,
                    gradient_norm_initial: state.gradient_norm_initial,
                },
                output_dict: OutputCheckpoint {
                    history: history.clone(),
                    iterations: state.iteration + 1,
                    state_solves: counts.state,
                    adjoint_solves: counts.adjoint,
                },
            };
            checkpoint.save()?;
        }
        self.comm.barrier();

        Ok(RelaunchRequest {
            program: self.program.clone(),
            args: relaunch_arguments(&self.args, &self.temp_dir)?,
        })
    }

    /// Deletes the files of the previous remeshing epoch.
    fn clean_previous_files(&self) -> Result<()> {
        let Some(previous) = self.remesh_counter.checked_sub(1) else {
            return Ok(());
        };
        for suffix in [".msh", "_pre_remesh.msh", "_converted.msh"] {
            let path = self.epoch_file(previous, suffix);
            if path.is_file() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Removes the temporary and remeshing directories unless
    /// `debug.remeshing` keeps them.
    pub fn clear_temp_files(&self) -> Result<()> {
        if !self.keep_files && self.comm.is_root() {
            for dir in [&self.temp_dir, &self.remesh_directory] {
                if dir.is_dir() {
                    fs::remove_dir_all(dir)?;
                }
            }
        }
        self.comm.barrier();
        Ok(())
    }
}
