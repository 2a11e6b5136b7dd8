//! Demonstration shape problem: deform the domain into a disk.
//!
//! The objective is `J(Ω) = ∫_Ω f dx` with `f(x) = |x - c|² - r²`, which is
//! smallest when `Ω` is the ball of radius `r` around `c`. It is discretized
//! with vertex-mean quadrature on the simplices of the mesh, and the gradient
//! is the exact derivative of that sum with respect to the vertex positions,
//! mapped to its Riesz representative with `S = K + M_lumped` (a vector
//! Laplacian plus a lumped mass term).

use anyhow::{bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use tracing::debug;

use sculpt_core::linalg::{ConjugateGradient, LinearSolver, SolverOptions};
use sculpt_core::mesh::dof_map::DofMap;
use sculpt_core::mesh::Mesh;
use sculpt_core::{ReducedProblem, SolveCounts};

/// Volume and barycentric-coordinate gradients of one simplex.
struct CellGeometry {
    volume: f64,
    gradients: Vec<DVector<f64>>,
}

fn cell_geometry(dim: usize, coordinates: &[f64], cell: &[usize]) -> Result<CellGeometry> {
    let base = cell[0] * dim;
    let edges = DMatrix::from_fn(dim, dim, |row, col| {
        coordinates[cell[col + 1] * dim + row] - coordinates[base + row]
    });
    let factorial = if dim == 2 { 2.0 } else { 6.0 };
    let volume = edges.determinant().abs() / factorial;
    let Some(inverse) = edges.try_inverse() else {
        bail!("degenerate cell {cell:?}");
    };

    let mut gradients = Vec::with_capacity(dim + 1);
    let mut first = DVector::zeros(dim);
    for k in 0..dim {
        let g: DVector<f64> = inverse.row(k).transpose();
        first -= &g;
        gradients.push(g);
    }
    gradients.insert(0, first);
    Ok(CellGeometry { volume, gradients })
}

pub struct DiskProblem {
    dim: usize,
    cells: Vec<usize>,
    dof_map: DofMap,
    center: Vec<f64>,
    radius: f64,
    riesz: CsrMatrix<f64>,
    options: SolverOptions,
    counts: SolveCounts,
}

impl DiskProblem {
    pub fn new(mesh: &Mesh, dof_map: &DofMap, center: Vec<f64>, radius: f64) -> Result<Self> {
        if center.len() != mesh.dim() {
            bail!(
                "the center has {} components but the mesh is {}-dimensional",
                center.len(),
                mesh.dim()
            );
        }
        if !(radius > 0.0) {
            bail!("the radius has to be positive, got {radius}");
        }
        let mut problem = Self {
            dim: mesh.dim(),
            cells: mesh.cells().to_vec(),
            dof_map: dof_map.clone(),
            center,
            radius,
            riesz: CsrMatrix::zeros(dof_map.len(), dof_map.len()),
            options: SolverOptions::new()
                .with("ksp_rtol", 1e-12)
                .with("ksp_atol", 1e-14)
                .with("ksp_max_it", 10 * dof_map.len().max(100))
                .with("pc_type", "jacobi"),
            counts: SolveCounts::default(),
        };
        problem.riesz = problem.assemble_riesz_matrix(mesh.coordinates())?;
        Ok(problem)
    }

    /// Continues the solve counters of a run interrupted by remeshing.
    pub fn with_solve_counts(mut self, counts: SolveCounts) -> Self {
        self.counts = counts;
        self
    }

    fn level(&self, p: &[f64]) -> f64 {
        p.iter()
            .zip(&self.center)
            .map(|(x, c)| (x - c) * (x - c))
            .sum::<f64>()
            - self.radius * self.radius
    }

    fn cells(&self) -> impl Iterator<Item = &[usize]> {
        self.cells.chunks(self.dim + 1)
    }

    fn assemble_riesz_matrix(&self, coordinates: &[f64]) -> Result<CsrMatrix<f64>> {
        let n = self.dof_map.len();
        let mut coo = CooMatrix::new(n, n);
        let lumped = 1.0 / (self.dim + 1) as f64;
        for cell in self.cells() {
            let geometry = cell_geometry(self.dim, coordinates, cell)?;
            for (a, &va) in cell.iter().enumerate() {
                for (b, &vb) in cell.iter().enumerate() {
                    let mut entry = geometry.volume * geometry.gradients[a].dot(&geometry.gradients[b]);
                    if a == b {
                        entry += lumped * geometry.volume;
                    }
                    for k in 0..self.dim {
                        coo.push(self.dof_map.dof(va, k), self.dof_map.dof(vb, k), entry);
                    }
                }
            }
        }
        Ok(CsrMatrix::from(&coo))
    }

    /// Derivative of the discrete objective with respect to the vertex
    /// positions, in DOF ordering.
    fn shape_derivative(&self, coordinates: &[f64]) -> Result<DVector<f64>> {
        let mut derivative = DVector::zeros(self.dof_map.len());
        let weight = 1.0 / (self.dim + 1) as f64;
        for cell in self.cells() {
            let geometry = cell_geometry(self.dim, coordinates, cell)?;
            let mean = weight
                * cell
                    .iter()
                    .map(|&v| self.level(&coordinates[v * self.dim..(v + 1) * self.dim]))
                    .sum::<f64>();
            for (a, &v) in cell.iter().enumerate() {
                let p = &coordinates[v * self.dim..(v + 1) * self.dim];
                for k in 0..self.dim {
                    let volume_term = geometry.volume * geometry.gradients[a][k] * mean;
                    let level_term = geometry.volume * weight * 2.0 * (p[k] - self.center[k]);
                    derivative[self.dof_map.dof(v, k)] += volume_term + level_term;
                }
            }
        }
        Ok(derivative)
    }
}

impl ReducedProblem for DiskProblem {
    fn dimension(&self) -> usize {
        self.dof_map.len()
    }

    fn objective(&mut self, x: &DVector<f64>) -> Result<f64> {
        self.counts.state += 1;
        let coordinates = self.dof_map.to_coordinates(x)?;
        let weight = 1.0 / (self.dim + 1) as f64;
        let mut value = 0.0;
        for cell in self.cells() {
            let geometry = cell_geometry(self.dim, &coordinates, cell)?;
            let sum: f64 = cell
                .iter()
                .map(|&v| self.level(&coordinates[v * self.dim..(v + 1) * self.dim]))
                .sum();
            value += geometry.volume * weight * sum;
        }
        Ok(value)
    }

    /// Reassembles `S` on the current mesh and solves `S g = dJ`.
    fn gradient(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        self.counts.adjoint += 1;
        let coordinates = self.dof_map.to_coordinates(x)?;
        self.riesz = self.assemble_riesz_matrix(&coordinates)?;
        let derivative = self.shape_derivative(&coordinates)?;
        let mut operator = self.riesz.clone();
        *out = ConjugateGradient
            .solve(&mut operator, &derivative, &self.options)
            .context("Riesz projection of the shape derivative")?;
        debug!(norm = out.norm(), "computed shape gradient");
        Ok(())
    }

    fn scalar_product(&self, a: &DVector<f64>, b: &DVector<f64>) -> f64 {
        let mut sb = DVector::zeros(b.len());
        sculpt_core::linalg::csr_mul_into(&self.riesz, b, &mut sb);
        a.dot(&sb)
    }

    fn scalar_product_matrix(&self) -> Option<&CsrMatrix<f64>> {
        Some(&self.riesz)
    }

    fn solve_counts(&self) -> SolveCounts {
        self.counts
    }
}
