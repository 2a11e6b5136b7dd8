//! Corner-angle constraints `min_angle - θ <= 0`.
//!
//! In 2D every corner of every triangle is constrained; in 3D every corner of
//! every (deduplicated) face of the tetrahedra.

use std::collections::HashSet;

use nalgebra::DVector;

use crate::mesh::dof_map::DofMap;
use crate::mesh::Mesh;

/// The angle at `vertex` between the edges towards `first` and `second`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AngleConstraint {
    pub vertex: usize,
    pub first: usize,
    pub second: usize,
}

pub fn corner_constraints(mesh: &Mesh) -> Vec<AngleConstraint> {
    let mut constraints = Vec::new();
    let mut seen = HashSet::new();
    for c in 0..mesh.num_cells() {
        let cell = mesh.cell(c);
        let faces: Vec<[usize; 3]> = if mesh.dim() == 2 {
            vec![[cell[0], cell[1], cell[2]]]
        } else {
            (0..4)
                .map(|skip| {
                    let mut face = [0usize; 3];
                    let mut k = 0;
                    for (i, &v) in cell.iter().enumerate() {
                        if i != skip {
                            face[k] = v;
                            k += 1;
                        }
                    }
                    face
                })
                .collect()
        };
        for face in faces {
            for corner in 0..3 {
                let vertex = face[corner];
                let a = face[(corner + 1) % 3];
                let b = face[(corner + 2) % 3];
                let constraint = AngleConstraint {
                    vertex,
                    first: a.min(b),
                    second: a.max(b),
                };
                if seen.insert(constraint) {
                    constraints.push(constraint);
                }
            }
        }
    }
    constraints
}

fn point(x: &DVector<f64>, dof_map: &DofMap, vertex: usize) -> [f64; 3] {
    let mut p = [0.0; 3];
    for (c, value) in p.iter_mut().enumerate().take(dof_map.dim()) {
        *value = x[dof_map.dof(vertex, c)];
    }
    p
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

impl AngleConstraint {
    /// Current angle for coordinates `x` in DOF ordering.
    pub fn angle(&self, x: &DVector<f64>, dof_map: &DofMap) -> f64 {
        let p = point(x, dof_map, self.vertex);
        let u = sub(point(x, dof_map, self.first), p);
        let v = sub(point(x, dof_map, self.second), p);
        let cosine = dot(u, v) / (norm(u) * norm(v));
        cosine.clamp(-1.0, 1.0).acos()
    }

    /// Derivatives of the angle with respect to the positions of `vertex`,
    /// `first` and `second`, in that order.
    ///
    /// With `u = first - vertex`, `v = second - vertex`:
    /// `∂θ/∂first = -(v̂ - cosθ û) / (|u| sinθ)` and symmetrically for `second`.
    pub fn angle_gradient(&self, x: &DVector<f64>, dof_map: &DofMap) -> [(usize, [f64; 3]); 3] {
        let p = point(x, dof_map, self.vertex);
        let u = sub(point(x, dof_map, self.first), p);
        let v = sub(point(x, dof_map, self.second), p);
        let (nu, nv) = (norm(u), norm(v));
        let u_hat = [u[0] / nu, u[1] / nu, u[2] / nu];
        let v_hat = [v[0] / nv, v[1] / nv, v[2] / nv];
        let cosine = dot(u_hat, v_hat).clamp(-1.0, 1.0);
        let sine = (1.0 - cosine * cosine).sqrt().max(f64::EPSILON);

        let mut d_first = [0.0; 3];
        let mut d_second = [0.0; 3];
        let mut d_vertex = [0.0; 3];
        for i in 0..3 {
            d_first[i] = -(v_hat[i] - cosine * u_hat[i]) / (nu * sine);
            d_second[i] = -(u_hat[i] - cosine * v_hat[i]) / (nv * sine);
            d_vertex[i] = -(d_first[i] + d_second[i]);
        }
        [
            (self.vertex, d_vertex),
            (self.first, d_first),
            (self.second, d_second),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{regular_box_mesh, regular_mesh};
    use approx::assert_relative_eq;

    #[test]
    fn test_constraint_counts() {
        let mesh = regular_mesh(2, 1.0, 1.0).unwrap();
        assert_eq!(corner_constraints(&mesh).len(), 3 * mesh.num_cells());

        let single = Mesh::new(3, vec![0., 0., 0., 1., 0., 0., 0., 1., 0., 0., 0., 1.], vec![0, 1, 2, 3]).unwrap();
        assert_eq!(corner_constraints(&single).len(), 12);

        // shared faces are counted once
        let mesh = regular_box_mesh(1, 1.0, 1.0, 1.0).unwrap();
        assert!(corner_constraints(&mesh).len() < 12 * mesh.num_cells());
    }

    #[test]
    fn test_angle_gradient_matches_finite_differences() {
        let mesh = Mesh::new(2, vec![0.0, 0.0, 1.2, 0.1, 0.3, 0.9], vec![0, 1, 2]).unwrap();
        let dof_map = DofMap::new(&mesh);
        let x = dof_map.to_dofs(mesh.coordinates()).unwrap();
        let constraint = AngleConstraint {
            vertex: 0,
            first: 1,
            second: 2,
        };
        let gradient = constraint.angle_gradient(&x, &dof_map);
        let h = 1e-7;
        for (vertex, derivative) in gradient {
            for c in 0..2 {
                let dof = dof_map.dof(vertex, c);
                let mut plus = x.clone();
                plus[dof] += h;
                let mut minus = x.clone();
                minus[dof] -= h;
                let fd = (constraint.angle(&plus, &dof_map) - constraint.angle(&minus, &dof_map)) / (2.0 * h);
                assert_relative_eq!(derivative[c], fd, epsilon = 1e-6);
            }
        }
    }
}
