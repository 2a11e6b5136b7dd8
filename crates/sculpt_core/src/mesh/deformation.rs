//! Moves the mesh by a deformation field and guarantees that the result is a
//! valid (non-inverted, non-overlapping) mesh.

use std::rc::Rc;

use nalgebra::DVector;
use tracing::debug;

use crate::error::{Result, SculptError};
use crate::mesh::bbtree::BoundingBoxTree;
use crate::mesh::dof_map::DofMap;
use crate::mesh::{edge_matrix_of, Mesh};
use crate::traits::Communicator;

/// Owner of the mesh coordinates.
///
/// Every accepted move keeps a snapshot of the previous coordinates so that the
/// caller can undo it with [`DeformationHandler::revert_transformation`]. Only one
/// transformation can be pending; the next move replaces the snapshot.
pub struct DeformationHandler {
    mesh: Mesh,
    dof_map: DofMap,
    tree: BoundingBoxTree,
    reference_counts: Vec<usize>,
    snapshot: Option<Vec<f64>>,
    volume_change: f64,
    comm: Rc<dyn Communicator>,
}

impl DeformationHandler {
    pub fn new(mesh: Mesh, volume_change: f64, comm: Rc<dyn Communicator>) -> Self {
        let dof_map = DofMap::new(&mesh);
        let tree = BoundingBoxTree::build(&mesh);
        let reference_counts = mesh.vertex_cell_counts();
        Self {
            mesh,
            dof_map,
            tree,
            reference_counts,
            snapshot: None,
            volume_change,
            comm,
        }
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn dof_map(&self) -> &DofMap {
        &self.dof_map
    }

    pub fn communicator(&self) -> &dyn Communicator {
        &*self.comm
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn dof_to_coordinate(&self, dofs: &DVector<f64>) -> Result<Vec<f64>> {
        self.dof_map.to_coordinates(dofs)
    }

    pub fn coordinate_to_dof(&self, coordinates: &[f64]) -> Result<DVector<f64>> {
        self.dof_map.to_dofs(coordinates)
    }

    /// Moves the mesh by a deformation given in DOF ordering.
    ///
    /// Returns `Ok(false)` if the deformation was rejected by either check; the
    /// coordinates are then unchanged.
    pub fn move_mesh(&mut self, deformation: &DVector<f64>, validated_a_priori: bool) -> Result<bool> {
        let coordinate_deformation = self.dof_map.to_coordinates(deformation)?;
        self.move_mesh_coordinates(&coordinate_deformation, validated_a_priori)
    }

    /// Moves the mesh by a deformation given as a flat `N × d` coordinate array.
    pub fn move_mesh_coordinates(
        &mut self,
        coordinate_deformation: &[f64],
        validated_a_priori: bool,
    ) -> Result<bool> {
        if coordinate_deformation.len() != self.mesh.coordinates().len() {
            return Err(SculptError::invalid_input(
                "move_mesh",
                format!(
                    "deformation has {} entries, the mesh has {} coordinates",
                    coordinate_deformation.len(),
                    self.mesh.coordinates().len()
                ),
            ));
        }

        if !validated_a_priori && !self.test_a_priori(coordinate_deformation) {
            debug!("mesh transformation rejected due to a priori check");
            return Ok(false);
        }

        self.snapshot = Some(self.mesh.coordinates().to_vec());
        for (x, dx) in self
            .mesh
            .coordinates_mut()
            .iter_mut()
            .zip(coordinate_deformation)
        {
            *x += dx;
        }
        self.tree = BoundingBoxTree::build(&self.mesh);

        if self.test_a_posteriori() {
            Ok(true)
        } else {
            debug!("mesh transformation rejected due to a posteriori check");
            self.revert_transformation();
            Ok(false)
        }
    }

    /// Per-cell volume ratios `det(E + U) / det(E)` of a deformation, i.e. the
    /// cellwise value of `det(I + ∇u)` for a P1 field.
    pub fn volume_ratios(&self, coordinate_deformation: &[f64]) -> Vec<f64> {
        let dim = self.mesh.dim();
        (0..self.mesh.num_cells())
            .map(|c| {
                let cell = self.mesh.cell(c);
                let reference = self.mesh.edge_matrix(c);
                let displacement = edge_matrix_of(dim, coordinate_deformation, cell);
                (&reference + displacement).determinant() / reference.determinant()
            })
            .collect()
    }

    /// Accepts iff no cell is inverted and, for a finite `volume_change`, every
    /// volume ratio lies in `[1 / volume_change, volume_change]`.
    pub fn test_a_priori(&self, coordinate_deformation: &[f64]) -> bool {
        let ratios = self.volume_ratios(coordinate_deformation);
        // NaN counts as inverted; every rank still runs the same collectives
        let local_min = ratios
            .iter()
            .map(|&r| if r.is_nan() { f64::NEG_INFINITY } else { r })
            .fold(f64::INFINITY, f64::min);
        let local_max = ratios.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = self.comm.all_min(local_min);
        let max = self.comm.all_max(local_max);

        if min <= 0.0 {
            return false;
        }
        if self.volume_change.is_finite() {
            return min >= 1.0 / self.volume_change && max <= self.volume_change;
        }
        true
    }

    /// Checks that every vertex lies in exactly as many cells as it did in the
    /// reference topology.
    pub fn test_a_posteriori(&self) -> bool {
        let local = (0..self.mesh.num_vertices()).all(|v| {
            let hits = self
                .tree
                .compute_entity_collisions(&self.mesh, self.mesh.vertex(v));
            hits.len() == self.reference_counts[v]
        });
        self.comm.barrier();
        self.comm.all_and(local)
    }

    /// Restores the coordinates saved by the last transformation.
    ///
    /// # Panics
    ///
    /// Panics if no transformation is pending.
    pub fn revert_transformation(&mut self) {
        let snapshot = self
            .snapshot
            .take()
            .expect("revert_transformation called without a pending transformation");
        self.mesh.replace_coordinates(&snapshot);
        self.tree = BoundingBoxTree::build(&self.mesh);
    }

    /// Overwrites the coordinates (flat `N × d`) and validates the result.
    pub fn assign_coordinates(&mut self, coordinates: &[f64]) -> Result<bool> {
        if coordinates.len() != self.mesh.coordinates().len() {
            return Err(SculptError::invalid_input(
                "assign_coordinates",
                format!(
                    "expected {} coordinates, got {}",
                    self.mesh.coordinates().len(),
                    coordinates.len()
                ),
            ));
        }
        self.snapshot = Some(self.mesh.coordinates().to_vec());
        self.mesh.replace_coordinates(coordinates);
        self.tree = BoundingBoxTree::build(&self.mesh);
        Ok(self.test_a_posteriori())
    }

    /// Largest cellwise Frobenius norm of the deformation gradient.
    pub fn max_deformation_gradient_norm(&self, coordinate_deformation: &[f64]) -> f64 {
        let dim = self.mesh.dim();
        let local = (0..self.mesh.num_cells())
            .filter_map(|c| {
                let cell = self.mesh.cell(c);
                let inverse = self.mesh.edge_matrix(c).try_inverse()?;
                let displacement = edge_matrix_of(dim, coordinate_deformation, cell);
                Some((displacement * inverse).norm())
            })
            .fold(0.0, f64::max);
        self.comm.all_max(local)
    }
}
