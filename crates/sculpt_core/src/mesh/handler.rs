use std::path::{Path, PathBuf};
use std::rc::Rc;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::error::{Result, SculptError};
use crate::mesh::deformation::DeformationHandler;
use crate::mesh::gmsh;
use crate::mesh::quality::{compute_mesh_quality, QualityMeasure, QualityReduction};
use crate::mesh::Mesh;
use crate::traits::Communicator;

/// Current mesh quality and the thresholds it is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeshQualityRecord {
    pub current: f64,
    pub tol_lower: f64,
    pub tol_upper: f64,
    pub measure: QualityMeasure,
    pub reduction: QualityReduction,
}

/// Mesh state of a shape optimization: deformation, quality monitoring and the
/// link back to the Gmsh file the mesh came from.
pub struct MeshHandler {
    deformation: DeformationHandler,
    quality: MeshQualityRecord,
    angle_change: f64,
    beta_armijo: f64,
    gmsh_source: Option<(PathBuf, Vec<usize>)>,
}

impl MeshHandler {
    /// Fails if the quality of `mesh` is already below `tol_lower`.
    pub fn new(mesh: Mesh, config: &Config, comm: Rc<dyn Communicator>) -> Result<Self> {
        let settings = &config.mesh_quality;
        if !(settings.tol_lower < settings.tol_upper) {
            return Err(SculptError::incompatible(
                "mesh_quality.tol_lower has to be strictly smaller than mesh_quality.tol_upper",
            ));
        }
        let current = compute_mesh_quality(&mesh, settings.measure, settings.reduction, &*comm);
        let quality = MeshQualityRecord {
            current,
            tol_lower: settings.tol_lower,
            tol_upper: settings.tol_upper,
            measure: settings.measure,
            reduction: settings.reduction,
        };
        if current < quality.tol_lower {
            return Err(SculptError::invalid_input(
                "mesh import",
                format!(
                    "the quality of the mesh ({current:.3e}) is below mesh_quality.tol_lower ({:.3e})",
                    quality.tol_lower
                ),
            ));
        }
        Ok(Self {
            deformation: DeformationHandler::new(mesh, settings.volume_change, comm),
            quality,
            angle_change: settings.angle_change,
            beta_armijo: config.line_search.beta_armijo,
            gmsh_source: None,
        })
    }

    /// Remembers the Gmsh file (and node tags) the mesh was read from.
    pub fn with_gmsh_source(mut self, path: impl Into<PathBuf>, node_tags: Vec<usize>) -> Self {
        self.gmsh_source = Some((path.into(), node_tags));
        self
    }

    /// After remeshing the new mesh must already satisfy `tol_upper`, otherwise
    /// the optimization would remesh again immediately.
    pub fn check_remeshed_quality(&self) -> Result<()> {
        if self.quality.current < self.quality.tol_upper {
            return Err(SculptError::invalid_input(
                "remeshing",
                format!(
                    "the quality of the remeshed mesh ({:.3e}) is below mesh_quality.tol_upper ({:.3e})",
                    self.quality.current, self.quality.tol_upper
                ),
            ));
        }
        Ok(())
    }

    pub fn mesh(&self) -> &Mesh {
        self.deformation.mesh()
    }

    pub fn deformation_handler(&self) -> &DeformationHandler {
        &self.deformation
    }

    pub fn quality(&self) -> &MeshQualityRecord {
        &self.quality
    }

    pub fn current_quality(&self) -> f64 {
        self.quality.current
    }

    pub fn gmsh_file(&self) -> Option<&Path> {
        self.gmsh_source.as_ref().map(|(p, _)| p.as_path())
    }

    /// Coordinates of the mesh in DOF ordering.
    pub fn coordinate_dofs(&self) -> Result<DVector<f64>> {
        self.deformation.coordinate_to_dof(self.mesh().coordinates())
    }

    /// Moves the mesh by the perturbation of identity `x + V(x)` and refreshes
    /// the quality.
    pub fn move_mesh(&mut self, deformation: &DVector<f64>) -> Result<bool> {
        let coordinate_deformation = self.deformation.dof_to_coordinate(deformation)?;
        if !self.deformation.test_a_priori(&coordinate_deformation) {
            debug!("mesh transformation rejected due to a priori check");
            return Ok(false);
        }
        let moved = self
            .deformation
            .move_mesh_coordinates(&coordinate_deformation, true)?;
        self.refresh_quality();
        Ok(moved)
    }

    pub fn revert_transformation(&mut self) {
        self.deformation.revert_transformation();
        self.refresh_quality();
    }

    fn refresh_quality(&mut self) {
        self.quality.current = compute_mesh_quality(
            self.mesh(),
            self.quality.measure,
            self.quality.reduction,
            self.deformation.communicator(),
        );
    }

    /// Number of stepsize decreases needed so that the cellwise Frobenius norm of
    /// `stepsize · ∇direction` stays below `angle_change`.
    pub fn compute_decreases(&self, direction: &DVector<f64>, stepsize: f64) -> Result<usize> {
        if self.angle_change.is_infinite() {
            return Ok(0);
        }
        let coordinate_direction = self.deformation.dof_to_coordinate(direction)?;
        let frobenius = self
            .deformation
            .max_deformation_gradient_norm(&coordinate_direction);
        if !(frobenius > 0.0) || !(stepsize > 0.0) {
            return Ok(0);
        }
        let decreases =
            ((self.angle_change / stepsize / frobenius).ln() / (1.0 / self.beta_armijo).ln()).ceil();
        Ok(decreases.max(0.0) as usize)
    }

    pub fn requires_remeshing(&self, iteration: usize, remesh_iter: usize) -> bool {
        remesh_required(self.quality.current, self.quality.tol_upper, iteration, remesh_iter)
    }

    /// Writes the current mesh as MSH 2.2, reusing the original Gmsh file when
    /// there is one.
    pub fn write_mesh(&self, output: &Path) -> Result<()> {
        match &self.gmsh_source {
            Some((original, node_tags)) => gmsh::write_out_mesh(self.mesh(), node_tags, original, output),
            None => gmsh::write_msh(self.mesh(), output),
        }
    }
}

/// Remeshing is due when the quality dropped below `tol_upper`, or every
/// `remesh_iter` iterations (0 disables the periodic trigger).
pub fn remesh_required(quality: f64, tol_upper: f64, iteration: usize, remesh_iter: usize) -> bool {
    let quality_criterion = quality < tol_upper;
    let iteration_criterion = remesh_iter > 0 && iteration > 0 && iteration % remesh_iter == 0;
    quality_criterion || iteration_criterion
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::regular_mesh;
    use crate::traits::SerialCommunicator;
    use approx::assert_relative_eq;

    fn handler(config: &Config) -> MeshHandler {
        let mesh = regular_mesh(3, 1.0, 1.0).unwrap();
        MeshHandler::new(mesh, config, Rc::new(SerialCommunicator)).unwrap()
    }

    fn stretch_dofs(handler: &MeshHandler, factor: f64) -> DVector<f64> {
        let coordinates: Vec<f64> = handler
            .mesh()
            .coordinates()
            .chunks(2)
            .flat_map(|p| [(factor - 1.0) * p[0], 0.0])
            .collect();
        handler
            .deformation_handler()
            .coordinate_to_dof(&coordinates)
            .unwrap()
    }

    #[test]
    fn test_remesh_trigger_sequence() {
        let triggers: Vec<bool> = [0.5, 0.3, 0.05]
            .iter()
            .map(|&q| remesh_required(q, 0.1, 1, 0))
            .collect();
        assert_eq!(triggers, vec![false, false, true]);
        assert!(remesh_required(0.9, 0.1, 6, 3));
        assert!(!remesh_required(0.9, 0.1, 0, 3));
        assert!(!remesh_required(0.9, 0.1, 5, 3));
    }

    #[test]
    fn test_import_rejects_poor_quality() {
        let mut config = Config::default();
        config.mesh_quality.tol_lower = 0.8;
        config.mesh_quality.tol_upper = 0.9;
        let mesh = regular_mesh(2, 1.0, 1.0).unwrap();
        assert!(MeshHandler::new(mesh, &config, Rc::new(SerialCommunicator)).is_err());
    }

    #[test]
    fn test_move_updates_quality_and_revert_restores_it() {
        let config = Config::default();
        let mut handler = handler(&config);
        let initial = handler.current_quality();
        assert!(handler.move_mesh(&stretch_dofs(&handler, 2.0)).unwrap());
        assert!(handler.current_quality() < initial);
        handler.revert_transformation();
        assert_relative_eq!(handler.current_quality(), initial);
    }

    #[test]
    fn test_compute_decreases_from_angle_change() {
        let mut config = Config::default();
        config.mesh_quality.angle_change = 0.25;
        let handler = handler(&config);
        let direction = stretch_dofs(&handler, 2.0);
        assert_eq!(handler.compute_decreases(&direction, 1.0).unwrap(), 2);
        assert_eq!(handler.compute_decreases(&direction, 0.1).unwrap(), 0);

        let unlimited = self::handler(&Config::default());
        assert_eq!(unlimited.compute_decreases(&direction, 1e6).unwrap(), 0);
    }

    #[test]
    fn test_remeshed_quality_check() {
        let mut config = Config::default();
        config.mesh_quality.tol_upper = 0.99;
        let handler = handler(&config);
        assert!(handler.check_remeshed_quality().is_err());
        config.mesh_quality.tol_upper = 0.1;
        assert!(self::handler(&config).check_remeshed_quality().is_ok());
    }
}
