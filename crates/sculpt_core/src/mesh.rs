//! Simplicial meshes (triangles in 2D, tetrahedra in 3D) and the machinery that
//! deforms them while keeping them valid.

pub mod bbtree;
pub mod deformation;
pub mod dof_map;
pub mod gmsh;
pub mod handler;
pub mod quality;

use std::collections::HashMap;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SculptError};

/// Vertex coordinates plus immutable cell connectivity.
///
/// Coordinates are stored flat with `dim` entries per vertex; cells are stored
/// flat with `dim + 1` vertex indices each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    dim: usize,
    coordinates: Vec<f64>,
    cells: Vec<usize>,
}

impl Mesh {
    pub fn new(dim: usize, coordinates: Vec<f64>, cells: Vec<usize>) -> Result<Self> {
        if dim != 2 && dim != 3 {
            return Err(SculptError::invalid_input(
                "mesh",
                format!("only 2D and 3D meshes are supported, got dimension {dim}"),
            ));
        }
        if coordinates.len() % dim != 0 {
            return Err(SculptError::invalid_input(
                "mesh",
                format!(
                    "coordinate array of length {} is not a multiple of {dim}",
                    coordinates.len()
                ),
            ));
        }
        let per_cell = dim + 1;
        if cells.len() % per_cell != 0 {
            return Err(SculptError::invalid_input(
                "mesh",
                format!(
                    "cell array of length {} is not a multiple of {per_cell}",
                    cells.len()
                ),
            ));
        }
        let num_vertices = coordinates.len() / dim;
        if let Some(&bad) = cells.iter().find(|&&v| v >= num_vertices) {
            return Err(SculptError::invalid_input(
                "mesh",
                format!("cell references vertex {bad}, but the mesh has {num_vertices} vertices"),
            ));
        }
        Ok(Self {
            dim,
            coordinates,
            cells,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn vertices_per_cell(&self) -> usize {
        self.dim + 1
    }

    pub fn num_vertices(&self) -> usize {
        self.coordinates.len() / self.dim
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len() / self.vertices_per_cell()
    }

    pub fn coordinates(&self) -> &[f64] {
        &self.coordinates
    }

    pub(crate) fn coordinates_mut(&mut self) -> &mut [f64] {
        &mut self.coordinates
    }

    pub fn cells(&self) -> &[usize] {
        &self.cells
    }

    pub fn vertex(&self, index: usize) -> &[f64] {
        &self.coordinates[index * self.dim..(index + 1) * self.dim]
    }

    pub fn cell(&self, index: usize) -> &[usize] {
        let n = self.vertices_per_cell();
        &self.cells[index * n..(index + 1) * n]
    }

    /// Edge vectors `x_k - x_0` of a cell as the columns of a `dim × dim` matrix.
    pub fn edge_matrix(&self, cell: usize) -> DMatrix<f64> {
        edge_matrix_of(self.dim, &self.coordinates, self.cell(cell))
    }

    /// Signed volume (area in 2D) of a cell.
    pub fn signed_volume(&self, cell: usize) -> f64 {
        let factorial = if self.dim == 2 { 2.0 } else { 6.0 };
        self.edge_matrix(cell).determinant() / factorial
    }

    pub fn volume(&self) -> f64 {
        (0..self.num_cells()).map(|c| self.signed_volume(c).abs()).sum()
    }

    /// Number of cells each vertex belongs to.
    pub fn vertex_cell_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_vertices()];
        for &v in &self.cells {
            counts[v] += 1;
        }
        counts
    }

    /// Vertex-to-vertex adjacency through shared cells, sorted and deduplicated.
    pub fn vertex_neighbors(&self) -> Vec<Vec<usize>> {
        let mut neighbors = vec![Vec::new(); self.num_vertices()];
        for c in 0..self.num_cells() {
            let cell = self.cell(c);
            for &a in cell {
                for &b in cell {
                    if a != b {
                        neighbors[a].push(b);
                    }
                }
            }
        }
        for list in &mut neighbors {
            list.sort_unstable();
            list.dedup();
        }
        neighbors
    }

    /// Facets that belong to exactly one cell, with sorted vertex indices.
    pub fn boundary_facets(&self) -> Vec<Vec<usize>> {
        let mut counts: HashMap<Vec<usize>, usize> = HashMap::new();
        for c in 0..self.num_cells() {
            let cell = self.cell(c);
            for skip in 0..cell.len() {
                let mut facet: Vec<usize> = cell
                    .iter()
                    .enumerate()
                    .filter(|(k, _)| *k != skip)
                    .map(|(_, &v)| v)
                    .collect();
                facet.sort_unstable();
                *counts.entry(facet).or_insert(0) += 1;
            }
        }
        let mut facets: Vec<Vec<usize>> = counts
            .into_iter()
            .filter(|(_, n)| *n == 1)
            .map(|(facet, _)| facet)
            .collect();
        facets.sort();
        facets
    }

    pub fn boundary_vertices(&self) -> Vec<bool> {
        let mut on_boundary = vec![false; self.num_vertices()];
        for facet in self.boundary_facets() {
            for v in facet {
                on_boundary[v] = true;
            }
        }
        on_boundary
    }

    pub(crate) fn replace_coordinates(&mut self, coordinates: &[f64]) {
        self.coordinates.copy_from_slice(coordinates);
    }
}

pub(crate) fn edge_matrix_of(dim: usize, coordinates: &[f64], cell: &[usize]) -> DMatrix<f64> {
    let base = cell[0] * dim;
    DMatrix::from_fn(dim, dim, |row, col| {
        coordinates[cell[col + 1] * dim + row] - coordinates[base + row]
    })
}

/// Uniform triangulation of `[0, lx] × [0, ly]` with `n` subdivisions per side.
pub fn regular_mesh(n: usize, lx: f64, ly: f64) -> Result<Mesh> {
    if n == 0 || !(lx > 0.0) || !(ly > 0.0) {
        return Err(SculptError::invalid_input(
            "regular_mesh",
            "needs at least one subdivision and positive side lengths",
        ));
    }
    let stride = n + 1;
    let mut coordinates = Vec::with_capacity(stride * stride * 2);
    for j in 0..=n {
        for i in 0..=n {
            coordinates.push(lx * i as f64 / n as f64);
            coordinates.push(ly * j as f64 / n as f64);
        }
    }
    let mut cells = Vec::with_capacity(n * n * 6);
    for j in 0..n {
        for i in 0..n {
            let v0 = j * stride + i;
            let v1 = v0 + 1;
            let v2 = v1 + stride;
            let v3 = v0 + stride;
            cells.extend_from_slice(&[v0, v1, v2, v0, v2, v3]);
        }
    }
    Mesh::new(2, coordinates, cells)
}

/// Uniform tetrahedralization of `[0, lx] × [0, ly] × [0, lz]`; every cube is
/// split into six positively oriented tetrahedra along its main diagonal.
pub fn regular_box_mesh(n: usize, lx: f64, ly: f64, lz: f64) -> Result<Mesh> {
    if n == 0 || !(lx > 0.0) || !(ly > 0.0) || !(lz > 0.0) {
        return Err(SculptError::invalid_input(
            "regular_box_mesh",
            "needs at least one subdivision and positive side lengths",
        ));
    }
    let stride = n + 1;
    let index = |i: usize, j: usize, k: usize| (k * stride + j) * stride + i;
    let mut coordinates = Vec::with_capacity(stride * stride * stride * 3);
    for k in 0..=n {
        for j in 0..=n {
            for i in 0..=n {
                coordinates.push(lx * i as f64 / n as f64);
                coordinates.push(ly * j as f64 / n as f64);
                coordinates.push(lz * k as f64 / n as f64);
            }
        }
    }

    const PERMUTATIONS: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];
    // odd permutations produce negatively oriented paths
    const ODD: [bool; 6] = [false, true, true, false, false, true];

    let mut cells = Vec::with_capacity(n * n * n * 24);
    for k in 0..n {
        for j in 0..n {
            for i in 0..n {
                for (perm, &odd) in PERMUTATIONS.iter().zip(ODD.iter()) {
                    let mut offset = [0usize; 3];
                    let mut tet = [index(i, j, k); 4];
                    for (step, &axis) in perm.iter().enumerate() {
                        offset[axis] = 1;
                        tet[step + 1] = index(i + offset[0], j + offset[1], k + offset[2]);
                    }
                    if odd {
                        tet.swap(2, 3);
                    }
                    cells.extend_from_slice(&tet);
                }
            }
        }
    }
    Mesh::new(3, coordinates, cells)
}
