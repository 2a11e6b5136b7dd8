//! Per-cell quality measures and their global reduction.
//!
//! Every measure lies in `[0, 1]`, with 1 for the equilateral simplex and 0 for
//! degenerate cells.

use std::f64::consts::PI;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::mesh::Mesh;
use crate::traits::Communicator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityMeasure {
    Skewness,
    MaximumAngle,
    RadiusRatios,
    ConditionNumber,
}

impl std::fmt::Display for QualityMeasure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QualityMeasure::Skewness => "skewness",
            QualityMeasure::MaximumAngle => "maximum_angle",
            QualityMeasure::RadiusRatios => "radius_ratios",
            QualityMeasure::ConditionNumber => "condition_number",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityReduction {
    Min,
    #[serde(alias = "mean")]
    Avg,
}

/// Reduces the per-cell qualities of `mesh` to a single value over all ranks.
///
/// An empty mesh has quality 1.
pub fn compute_mesh_quality(
    mesh: &Mesh,
    measure: QualityMeasure,
    reduction: QualityReduction,
    comm: &dyn Communicator,
) -> f64 {
    let qualities = cell_qualities(mesh, measure);
    match reduction {
        QualityReduction::Min => {
            let local = qualities.iter().copied().fold(f64::INFINITY, f64::min);
            let min = comm.all_min(local);
            if min.is_finite() {
                min
            } else {
                1.0
            }
        }
        QualityReduction::Avg => {
            let sum = comm.all_sum(qualities.iter().sum());
            let count = comm.all_sum(qualities.len() as f64);
            if count > 0.0 {
                sum / count
            } else {
                1.0
            }
        }
    }
}

pub fn cell_qualities(mesh: &Mesh, measure: QualityMeasure) -> Vec<f64> {
    let reference_inverse = equilateral_edge_matrix(mesh.dim())
        .try_inverse()
        .unwrap_or_else(|| DMatrix::identity(mesh.dim(), mesh.dim()));
    (0..mesh.num_cells())
        .map(|c| {
            let edges = mesh.edge_matrix(c);
            let q = match measure {
                QualityMeasure::Skewness => skewness(&edges),
                QualityMeasure::MaximumAngle => maximum_angle(&edges),
                QualityMeasure::RadiusRatios => radius_ratio(&edges),
                QualityMeasure::ConditionNumber => condition_number(&edges, &reference_inverse),
            };
            if q.is_finite() {
                q.clamp(0.0, 1.0)
            } else {
                0.0
            }
        })
        .collect()
}

/// Optimal angle: interior angle of the equilateral triangle, dihedral angle of
/// the regular tetrahedron.
fn optimal_angle(dim: usize) -> f64 {
    if dim == 2 {
        PI / 3.0
    } else {
        (1.0f64 / 3.0).acos()
    }
}

/// Gradients of the barycentric coordinates, one per row.
fn barycentric_gradients(edges: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let dim = edges.nrows();
    let inverse = edges.clone().try_inverse()?;
    let mut gradients = DMatrix::zeros(dim + 1, dim);
    for k in 0..dim {
        for j in 0..dim {
            gradients[(k + 1, j)] = inverse[(k, j)];
            gradients[(0, j)] -= inverse[(k, j)];
        }
    }
    Some(gradients)
}

/// Interior angles of a triangle or dihedral angles of a tetrahedron.
///
/// The angle between the facets opposite vertices `k` and `l` has cosine
/// `-∇λ_k·∇λ_l / (|∇λ_k| |∇λ_l|)`.
pub fn cell_angles(edges: &DMatrix<f64>) -> Option<Vec<f64>> {
    let gradients = barycentric_gradients(edges)?;
    let n = gradients.nrows();
    let mut angles = Vec::with_capacity(n * (n - 1) / 2);
    for k in 0..n {
        for l in (k + 1)..n {
            let gk = gradients.row(k);
            let gl = gradients.row(l);
            let cosine = -gk.dot(&gl) / (gk.norm() * gl.norm());
            angles.push(cosine.clamp(-1.0, 1.0).acos());
        }
    }
    Some(angles)
}

fn skewness(edges: &DMatrix<f64>) -> f64 {
    let Some(angles) = cell_angles(edges) else {
        return 0.0;
    };
    let alpha = optimal_angle(edges.nrows());
    let max = angles.iter().copied().fold(f64::MIN, f64::max);
    let min = angles.iter().copied().fold(f64::MAX, f64::min);
    1.0 - ((max - alpha) / (PI - alpha)).max((alpha - min) / alpha)
}

fn maximum_angle(edges: &DMatrix<f64>) -> f64 {
    let Some(angles) = cell_angles(edges) else {
        return 0.0;
    };
    let alpha = optimal_angle(edges.nrows());
    let max = angles.iter().copied().fold(f64::MIN, f64::max);
    1.0 - ((max - alpha) / (PI - alpha)).max(0.0)
}

/// `d · r / R` with inradius `r = 1 / Σ|∇λ_k|` and circumradius from
/// `Eᵀ c = |e_k|² / 2`.
fn radius_ratio(edges: &DMatrix<f64>) -> f64 {
    let dim = edges.nrows();
    let Some(gradients) = barycentric_gradients(edges) else {
        return 0.0;
    };
    let inradius = 1.0 / gradients.row_iter().map(|g| g.norm()).sum::<f64>();
    let half_squares = nalgebra::DVector::from_fn(dim, |k, _| 0.5 * edges.column(k).norm_squared());
    let Some(center) = edges.transpose().lu().solve(&half_squares) else {
        return 0.0;
    };
    dim as f64 * inradius / center.norm()
}

/// `d / (‖J‖_F ‖J⁻¹‖_F)` for the map `J` from the equilateral reference cell.
fn condition_number(edges: &DMatrix<f64>, reference_inverse: &DMatrix<f64>) -> f64 {
    let jacobian = edges * reference_inverse;
    let Some(inverse) = jacobian.clone().try_inverse() else {
        return 0.0;
    };
    edges.nrows() as f64 / (jacobian.norm() * inverse.norm())
}

/// Edge matrix of the unit-edge equilateral simplex.
fn equilateral_edge_matrix(dim: usize) -> DMatrix<f64> {
    if dim == 2 {
        DMatrix::from_column_slice(2, 2, &[1.0, 0.0, 0.5, 3f64.sqrt() / 2.0])
    } else {
        DMatrix::from_column_slice(
            3,
            3,
            &[
                1.0,
                0.0,
                0.0,
                0.5,
                3f64.sqrt() / 2.0,
                0.0,
                0.5,
                3f64.sqrt() / 6.0,
                (2.0f64 / 3.0).sqrt(),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{regular_box_mesh, regular_mesh};
    use crate::traits::testing::MirroredCommunicator;
    use crate::traits::SerialCommunicator;
    use approx::assert_relative_eq;

    const ALL: [QualityMeasure; 4] = [
        QualityMeasure::Skewness,
        QualityMeasure::MaximumAngle,
        QualityMeasure::RadiusRatios,
        QualityMeasure::ConditionNumber,
    ];

    fn equilateral_triangle() -> Mesh {
        Mesh::new(2, vec![0.0, 0.0, 1.0, 0.0, 0.5, 3f64.sqrt() / 2.0], vec![0, 1, 2]).unwrap()
    }

    fn regular_tetrahedron() -> Mesh {
        let coords = equilateral_edge_matrix(3);
        let mut flat = vec![0.0; 3];
        for k in 0..3 {
            flat.extend(coords.column(k).iter());
        }
        Mesh::new(3, flat, vec![0, 1, 2, 3]).unwrap()
    }

    #[test]
    fn test_equilateral_cells_have_quality_one() {
        for mesh in [equilateral_triangle(), regular_tetrahedron()] {
            for measure in ALL {
                let q = compute_mesh_quality(&mesh, measure, QualityReduction::Min, &SerialCommunicator);
                assert_relative_eq!(q, 1.0, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_right_isosceles_triangle_values() {
        let mesh = regular_mesh(2, 1.0, 1.0).unwrap();
        let min = |m| compute_mesh_quality(&mesh, m, QualityReduction::Min, &SerialCommunicator);
        assert_relative_eq!(min(QualityMeasure::Skewness), 0.75, epsilon = 1e-12);
        assert_relative_eq!(min(QualityMeasure::MaximumAngle), 0.75, epsilon = 1e-12);
        assert_relative_eq!(
            min(QualityMeasure::RadiusRatios),
            2.0 * (2f64.sqrt() - 1.0),
            epsilon = 1e-12
        );
        assert_relative_eq!(
            min(QualityMeasure::ConditionNumber),
            3f64.sqrt() / 2.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_quality_is_idempotent_and_bounded() {
        let mesh = regular_box_mesh(2, 1.0, 2.0, 0.5).unwrap();
        for measure in ALL {
            for reduction in [QualityReduction::Min, QualityReduction::Avg] {
                let first = compute_mesh_quality(&mesh, measure, reduction, &SerialCommunicator);
                let second = compute_mesh_quality(&mesh, measure, reduction, &SerialCommunicator);
                assert_eq!(first.to_bits(), second.to_bits());
                assert!((0.0..=1.0).contains(&first));
            }
            let min = compute_mesh_quality(&mesh, measure, QualityReduction::Min, &SerialCommunicator);
            let avg = compute_mesh_quality(&mesh, measure, QualityReduction::Avg, &SerialCommunicator);
            assert!(min <= avg + 1e-15);
        }
    }

    #[test]
    fn test_quality_is_reduced_across_ranks() {
        let mesh = regular_mesh(2, 1.0, 1.0).unwrap();
        let comm = MirroredCommunicator::new(0.1);
        let min = compute_mesh_quality(&mesh, QualityMeasure::Skewness, QualityReduction::Min, &comm);
        assert_eq!(min, 0.1);
        let avg = compute_mesh_quality(&mesh, QualityMeasure::Skewness, QualityReduction::Avg, &comm);
        assert_relative_eq!(avg, 0.75, epsilon = 1e-12);
        assert_eq!(comm.calls(), vec!["min", "sum", "sum"]);
    }

    #[test]
    fn test_degenerate_cell_has_zero_quality() {
        let mesh = Mesh::new(2, vec![0.0, 0.0, 1.0, 0.0, 2.0, 0.0], vec![0, 1, 2]).unwrap();
        for measure in ALL {
            assert_eq!(cell_qualities(&mesh, measure), vec![0.0]);
        }
    }

    #[test]
    fn test_triangle_angles_sum_to_pi() {
        let mesh = Mesh::new(2, vec![0.0, 0.0, 2.0, 0.1, 0.4, 1.3], vec![0, 1, 2]).unwrap();
        let angles = cell_angles(&mesh.edge_matrix(0)).unwrap();
        assert_relative_eq!(angles.iter().sum::<f64>(), PI, epsilon = 1e-12);
    }
}
