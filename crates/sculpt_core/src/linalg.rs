//! Linear-solve contract and the small set of solvers the core needs itself.
//!
//! PDE systems are solved by the problem implementation; the core only solves
//! the auxiliary systems of the gradient projection and the inner Newton system.
//! Both go through [`LinearSolver`], configured by key-value [`SolverOptions`].

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use tracing::debug;

use crate::error::{DivergedReason, Result, SculptError};

/// Trait for an operator `A` that can be applied to a vector.
pub trait LinearOperator {
    fn nrows(&self) -> usize;

    /// out = A * x
    fn apply(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> Result<()>;

    /// Diagonal of the operator, used by the Jacobi preconditioner.
    fn diagonal(&self) -> Option<DVector<f64>> {
        None
    }
}

impl LinearOperator for CsrMatrix<f64> {
    fn nrows(&self) -> usize {
        CsrMatrix::nrows(self)
    }

    fn apply(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        csr_mul_into(self, x, out);
        Ok(())
    }

    fn diagonal(&self) -> Option<DVector<f64>> {
        let mut diag = DVector::zeros(CsrMatrix::nrows(self));
        for (i, row) in self.row_iter().enumerate() {
            for (&j, &v) in row.col_indices().iter().zip(row.values()) {
                if i == j {
                    diag[i] += v;
                }
            }
        }
        Some(diag)
    }
}

impl LinearOperator for DMatrix<f64> {
    fn nrows(&self) -> usize {
        DMatrix::nrows(self)
    }

    fn apply(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        out.gemv(1.0, self, x, 0.0);
        Ok(())
    }

    fn diagonal(&self) -> Option<DVector<f64>> {
        Some(DMatrix::diagonal(self))
    }
}

/// The normal-equations operator `x ↦ A (Aᵀ x)` for a sparse `A`.
pub struct GramOperator<'a> {
    a: &'a CsrMatrix<f64>,
    work: DVector<f64>,
}

impl<'a> GramOperator<'a> {
    pub fn new(a: &'a CsrMatrix<f64>) -> Self {
        Self {
            a,
            work: DVector::zeros(a.ncols()),
        }
    }
}

impl LinearOperator for GramOperator<'_> {
    fn nrows(&self) -> usize {
        self.a.nrows()
    }

    fn apply(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> Result<()> {
        csr_transpose_mul_into(self.a, x, &mut self.work);
        csr_mul_into(self.a, &self.work, out);
        Ok(())
    }

    fn diagonal(&self) -> Option<DVector<f64>> {
        let mut diag = DVector::zeros(self.a.nrows());
        for (i, row) in self.a.row_iter().enumerate() {
            diag[i] = row.values().iter().map(|v| v * v).sum();
        }
        Some(diag)
    }
}

/// Ordered key-value options handed to a linear solver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolverOptions {
    entries: Vec<(String, String)>,
}

impl SolverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, replacing an earlier value.
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_f64(&self, key: &str, default: f64) -> Result<f64> {
        match self.get(key) {
            Some(raw) => raw.parse::<f64>().map_err(|_| {
                SculptError::invalid_input("solver options", format!("{key} = {raw} is not a number"))
            }),
            None => Ok(default),
        }
    }

    pub fn get_usize(&self, key: &str, default: usize) -> Result<usize> {
        match self.get(key) {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                SculptError::invalid_input(
                    "solver options",
                    format!("{key} = {raw} is not a non-negative integer"),
                )
            }),
            None => Ok(default),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Contract for solving `A x = b`.
pub trait LinearSolver {
    fn name(&self) -> &str;

    fn solve(
        &self,
        operator: &mut dyn LinearOperator,
        rhs: &DVector<f64>,
        options: &SolverOptions,
    ) -> Result<DVector<f64>>;
}

/// Picks the solver named by the `ksp_type` option (`cg` or `preonly`).
pub fn solver_from_options(options: &SolverOptions) -> Result<Box<dyn LinearSolver>> {
    match options.get("ksp_type").unwrap_or("cg") {
        "cg" => Ok(Box::new(ConjugateGradient)),
        "preonly" => Ok(Box::new(DirectSolver)),
        other => Err(SculptError::invalid_input(
            "solver options",
            format!("unsupported ksp_type `{other}`"),
        )),
    }
}

/// Conjugate Gradient for symmetric positive definite operators.
///
/// Options: `ksp_rtol`, `ksp_atol`, `ksp_max_it`, `pc_type` (`jacobi` or `none`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ConjugateGradient;

impl LinearSolver for ConjugateGradient {
    fn name(&self) -> &str {
        "cg"
    }

    fn solve(
        &self,
        operator: &mut dyn LinearOperator,
        rhs: &DVector<f64>,
        options: &SolverOptions,
    ) -> Result<DVector<f64>> {
        let rtol = options.get_f64("ksp_rtol", 1e-10)?;
        let atol = options.get_f64("ksp_atol", 1e-50)?;
        let max_it = options.get_usize("ksp_max_it", 1000)?;
        let jacobi = options.get("pc_type").unwrap_or("jacobi") == "jacobi";

        let n = rhs.len();
        if operator.nrows() != n {
            return Err(SculptError::invalid_input(
                "cg",
                format!("operator has {} rows, right-hand side {}", operator.nrows(), n),
            ));
        }
        let b_norm = rhs.norm();
        if b_norm == 0.0 {
            return Ok(DVector::zeros(n));
        }

        let inv_diag = if jacobi {
            operator.diagonal().map(|d| {
                d.map(|v| if v.abs() > f64::MIN_POSITIVE { 1.0 / v } else { 1.0 })
            })
        } else {
            None
        };
        let precondition = |r: &DVector<f64>| match &inv_diag {
            Some(inv) => r.component_mul(inv),
            None => r.clone(),
        };

        let mut x = DVector::zeros(n);
        let mut r = rhs.clone();
        let mut z = precondition(&r);
        let mut p = z.clone();
        let mut rz = r.dot(&z);
        let mut ap = DVector::zeros(n);

        for iteration in 0..max_it {
            operator.apply(&p, &mut ap)?;
            let p_ap = p.dot(&ap);
            if !p_ap.is_finite() {
                return Err(diverged(self.name(), DivergedReason::NanOrInf, iteration));
            }
            if p_ap <= 0.0 {
                return Err(diverged(self.name(), DivergedReason::Indefinite, iteration));
            }
            let alpha = rz / p_ap;
            x.axpy(alpha, &p, 1.0);
            r.axpy(-alpha, &ap, 1.0);

            let r_norm = r.norm();
            if r_norm <= rtol * b_norm || r_norm <= atol {
                debug!(iterations = iteration + 1, residual = r_norm, "cg converged");
                return Ok(x);
            }

            z = precondition(&r);
            let rz_new = r.dot(&z);
            if rz.abs() < f64::MIN_POSITIVE {
                return Err(diverged(self.name(), DivergedReason::Breakdown, iteration));
            }
            let beta = rz_new / rz;
            rz = rz_new;
            p.axpy(1.0, &z, beta);
        }

        Err(diverged(self.name(), DivergedReason::Iterations, max_it))
    }
}

/// Dense LU factorization of the operator, for small systems.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectSolver;

impl LinearSolver for DirectSolver {
    fn name(&self) -> &str {
        "preonly"
    }

    fn solve(
        &self,
        operator: &mut dyn LinearOperator,
        rhs: &DVector<f64>,
        _options: &SolverOptions,
    ) -> Result<DVector<f64>> {
        let dense = assemble_dense(operator)?;
        dense
            .lu()
            .solve(rhs)
            .filter(|x| x.iter().all(|v| v.is_finite()))
            .ok_or_else(|| diverged(self.name(), DivergedReason::Singular, 0))
    }
}

/// Materializes an operator column by column.
pub fn assemble_dense(operator: &mut dyn LinearOperator) -> Result<DMatrix<f64>> {
    let n = operator.nrows();
    let mut dense = DMatrix::zeros(n, n);
    let mut unit = DVector::zeros(n);
    let mut column = DVector::zeros(n);
    for j in 0..n {
        unit[j] = 1.0;
        operator.apply(&unit, &mut column)?;
        dense.set_column(j, &column);
        unit[j] = 0.0;
    }
    Ok(dense)
}

fn diverged(solver: &str, reason: DivergedReason, iterations: usize) -> SculptError {
    SculptError::SolveDiverged {
        solver: solver.to_string(),
        reason,
        iterations,
    }
}

/// out = A x
pub fn csr_mul_into(a: &CsrMatrix<f64>, x: &DVector<f64>, out: &mut DVector<f64>) {
    if out.len() != a.nrows() {
        *out = DVector::zeros(a.nrows());
    }
    for (i, row) in a.row_iter().enumerate() {
        out[i] = row
            .col_indices()
            .iter()
            .zip(row.values())
            .map(|(&j, &v)| v * x[j])
            .sum();
    }
}

/// out = Aᵀ x
pub fn csr_transpose_mul_into(a: &CsrMatrix<f64>, x: &DVector<f64>, out: &mut DVector<f64>) {
    if out.len() != a.ncols() {
        *out = DVector::zeros(a.ncols());
    } else {
        out.fill(0.0);
    }
    for (i, row) in a.row_iter().enumerate() {
        let xi = x[i];
        if xi == 0.0 {
            continue;
        }
        for (&j, &v) in row.col_indices().iter().zip(row.values()) {
            out[j] += v * xi;
        }
    }
}

pub fn csr_mul(a: &CsrMatrix<f64>, x: &DVector<f64>) -> DVector<f64> {
    let mut out = DVector::zeros(a.nrows());
    csr_mul_into(a, x, &mut out);
    out
}

pub fn csr_transpose_mul(a: &CsrMatrix<f64>, x: &DVector<f64>) -> DVector<f64> {
    let mut out = DVector::zeros(a.ncols());
    csr_transpose_mul_into(a, x, &mut out);
    out
}

/// Keeps the rows of `a` for which `mask` is set, preserving their order.
pub fn select_rows(a: &CsrMatrix<f64>, mask: &[bool]) -> CsrMatrix<f64> {
    let selected: Vec<usize> = (0..a.nrows()).filter(|&i| mask[i]).collect();
    let mut coo = CooMatrix::new(selected.len(), a.ncols());
    for (new_i, &i) in selected.iter().enumerate() {
        let row = a.row(i);
        for (&j, &v) in row.col_indices().iter().zip(row.values()) {
            coo.push(new_i, j, v);
        }
    }
    CsrMatrix::from(&coo)
}

pub fn csr_to_dense(a: &CsrMatrix<f64>) -> DMatrix<f64> {
    let mut dense = DMatrix::zeros(a.nrows(), a.ncols());
    for (i, row) in a.row_iter().enumerate() {
        for (&j, &v) in row.col_indices().iter().zip(row.values()) {
            dense[(i, j)] += v;
        }
    }
    dense
}

/// Solves a small dense system, falling back to a least-squares solution
/// when the matrix is singular.
pub fn solve_dense_robust(matrix: DMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>> {
    if let Some(x) = matrix.clone().lu().solve(rhs) {
        if x.iter().all(|v| v.is_finite()) {
            return Ok(x);
        }
    }
    matrix
        .svd(true, true)
        .solve(rhs, 1e-12)
        .map_err(|e| diverged(&format!("svd ({e})"), DivergedReason::Singular, 0))
}
