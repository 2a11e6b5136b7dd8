//! Bijection between mesh vertex coordinates and the DOF ordering of the
//! vector-valued P1 deformation space.

use std::collections::VecDeque;

use nalgebra::DVector;

use crate::error::{Result, SculptError};
use crate::mesh::Mesh;

/// Vertex ↔ DOF permutation for a vector P1 field.
///
/// Vertices are numbered in reverse Cuthill–McKee order and the `dim`
/// components of a vertex are interleaved, so coordinate entry `v * dim + c`
/// maps to DOF `rank(v) * dim + c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DofMap {
    dim: usize,
    vertex_to_dof: Vec<usize>,
    dof_to_vertex: Vec<usize>,
}

impl DofMap {
    pub fn new(mesh: &Mesh) -> Self {
        let dim = mesh.dim();
        let order = reverse_cuthill_mckee(&mesh.vertex_neighbors());
        let size = mesh.num_vertices() * dim;
        let mut vertex_to_dof = vec![0usize; size];
        let mut dof_to_vertex = vec![0usize; size];
        for (rank, &vertex) in order.iter().enumerate() {
            for c in 0..dim {
                vertex_to_dof[vertex * dim + c] = rank * dim + c;
                dof_to_vertex[rank * dim + c] = vertex * dim + c;
            }
        }
        Self {
            dim,
            vertex_to_dof,
            dof_to_vertex,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.vertex_to_dof.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertex_to_dof.is_empty()
    }

    /// DOF index of coordinate entry `vertex * dim + component`.
    pub fn dof(&self, vertex: usize, component: usize) -> usize {
        self.vertex_to_dof[vertex * self.dim + component]
    }

    pub fn vertex_to_dof(&self) -> &[usize] {
        &self.vertex_to_dof
    }

    pub fn dof_to_vertex(&self) -> &[usize] {
        &self.dof_to_vertex
    }

    pub fn to_coordinates(&self, dofs: &DVector<f64>) -> Result<Vec<f64>> {
        self.check_len("dof_to_coordinate", dofs.len())?;
        Ok(self.vertex_to_dof.iter().map(|&d| dofs[d]).collect())
    }

    pub fn to_dofs(&self, coordinates: &[f64]) -> Result<DVector<f64>> {
        self.check_len("coordinate_to_dof", coordinates.len())?;
        Ok(DVector::from_iterator(
            self.len(),
            self.dof_to_vertex.iter().map(|&i| coordinates[i]),
        ))
    }

    fn check_len(&self, context: &str, len: usize) -> Result<()> {
        if len != self.len() {
            return Err(SculptError::invalid_input(
                context,
                format!("expected {} entries, got {len}", self.len()),
            ));
        }
        Ok(())
    }
}

/// Reverse Cuthill–McKee ordering of a graph given as adjacency lists.
///
/// Each connected component is started from a vertex of minimal degree;
/// neighbours are visited in order of increasing degree.
pub fn reverse_cuthill_mckee(adjacency: &[Vec<usize>]) -> Vec<usize> {
    let n = adjacency.len();
    let degree: Vec<usize> = adjacency.iter().map(Vec::len).collect();
    let mut visited = vec![false; n];
    let mut order = Vec::with_capacity(n);

    let mut by_degree: Vec<usize> = (0..n).collect();
    by_degree.sort_by_key(|&v| (degree[v], v));

    for &start in &by_degree {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        let mut queue = VecDeque::from([start]);
        while let Some(vertex) = queue.pop_front() {
            order.push(vertex);
            let mut next: Vec<usize> = adjacency[vertex]
                .iter()
                .copied()
                .filter(|&w| !visited[w])
                .collect();
            next.sort_by_key(|&w| (degree[w], w));
            for w in next {
                visited[w] = true;
                queue.push_back(w);
            }
        }
    }

    order.reverse();
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::regular_mesh;

    #[test]
    fn test_dof_map_is_a_bijection() {
        let mesh = regular_mesh(3, 1.0, 1.0).unwrap();
        let map = DofMap::new(&mesh);
        assert_eq!(map.len(), 32);
        let mut seen = vec![false; map.len()];
        for &d in map.vertex_to_dof() {
            assert!(!seen[d]);
            seen[d] = true;
        }
        for i in 0..map.len() {
            assert_eq!(map.dof_to_vertex()[map.vertex_to_dof()[i]], i);
        }
    }

    #[test]
    fn test_conversion_roundtrip_and_interleaving() {
        let mesh = regular_mesh(2, 1.0, 1.0).unwrap();
        let map = DofMap::new(&mesh);
        let dofs = map.to_dofs(mesh.coordinates()).unwrap();
        assert_eq!(map.to_coordinates(&dofs).unwrap(), mesh.coordinates());
        for v in 0..mesh.num_vertices() {
            assert_eq!(map.dof(v, 1), map.dof(v, 0) + 1);
        }
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let mesh = regular_mesh(1, 1.0, 1.0).unwrap();
        let map = DofMap::new(&mesh);
        assert!(map.to_dofs(&[0.0; 3]).is_err());
        assert!(map.to_coordinates(&DVector::zeros(9)).is_err());
    }

    #[test]
    fn test_rcm_reduces_bandwidth_of_path() {
        // path 0 - 3 - 1 - 4 - 2 in scrambled numbering
        let adjacency = vec![vec![3], vec![3, 4], vec![4], vec![0, 1], vec![1, 2]];
        let order = reverse_cuthill_mckee(&adjacency);
        assert_eq!(order.len(), 5);
        let mut rank = vec![0usize; 5];
        for (r, &v) in order.iter().enumerate() {
            rank[v] = r;
        }
        for (v, neighbors) in adjacency.iter().enumerate() {
            for &w in neighbors {
                assert_eq!(rank[v].abs_diff(rank[w]), 1);
            }
        }
    }
}
