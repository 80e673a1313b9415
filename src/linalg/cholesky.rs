use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
    sparse::{SparseColMat, Triplet},
};
use std::ops::Mul;

use crate::linalg::{LinAlgError, LinAlgResult, SparseLinearSolver};

/// Sparse Cholesky (LLᵀ) solver with a cached symbolic factorization.
///
/// The sparsity pattern of a pose graph does not change during a solve, so the symbolic
/// analysis runs once and every later iteration only redoes the numeric factorization.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    factorizer: Option<Llt<usize, f64>>,
    symbolic_factorization: Option<SymbolicLlt<usize>>,
    hessian: Option<SparseColMat<usize, f64>>,
    gradient: Option<Mat<f64>>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble `JᵀJ` and `Jᵀr` from the stacked whitened system.
    fn normal_equations(
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<(SparseColMat<usize, f64>, Mat<f64>)> {
        let jacobian_t = jacobians.as_ref().transpose();
        let jt_j = jacobian_t
            .to_col_major()
            .map_err(|e| {
                LinAlgError::MatrixConversion("transposed Jacobian to column-major".to_string())
                    .log_with_source(e)
            })?
            .mul(jacobians.as_ref());
        let jt_r = jacobian_t.mul(residuals);
        Ok((jt_j, jt_r))
    }

    /// Symbolic analysis of the first matrix seen; reused while the graph is unchanged.
    fn symbolic(&mut self, matrix: &SparseColMat<usize, f64>) -> LinAlgResult<SymbolicLlt<usize>> {
        if let Some(symbolic) = &self.symbolic_factorization {
            return Ok(symbolic.clone());
        }
        let symbolic = SymbolicLlt::try_new(matrix.symbolic(), Side::Lower).map_err(|e| {
            LinAlgError::FactorizationFailed("symbolic analysis of JᵀJ".to_string())
                .log_with_source(e)
        })?;
        self.symbolic_factorization = Some(symbolic.clone());
        Ok(symbolic)
    }

    fn factorize_and_solve(
        &mut self,
        matrix: &SparseColMat<usize, f64>,
        jt_r: &Mat<f64>,
    ) -> LinAlgResult<Mat<f64>> {
        let symbolic = self.symbolic(matrix)?;
        let llt = Llt::try_new_with_symbolic(symbolic, matrix.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;

        let step = llt.solve(-jt_r);
        let finite = (0..step.nrows()).all(|i| step[(i, 0)].is_finite());
        if !finite {
            return Err(LinAlgError::SingularMatrix.log());
        }
        self.factorizer = Some(llt);
        Ok(step)
    }

    fn keep(&mut self, jt_j: SparseColMat<usize, f64>, jt_r: Mat<f64>) {
        self.hessian = Some(jt_j);
        self.gradient = Some(jt_r);
    }
}

impl SparseLinearSolver for SparseCholeskySolver {
    fn solve_normal_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>> {
        let (jt_j, jt_r) = Self::normal_equations(residuals, jacobians)?;
        let step = self.factorize_and_solve(&jt_j, &jt_r)?;
        self.keep(jt_j, jt_r);
        Ok(step)
    }

    fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
        lambda: f64,
    ) -> LinAlgResult<Mat<f64>> {
        let dim = jacobians.ncols();
        let (jt_j, jt_r) = Self::normal_equations(residuals, jacobians)?;

        let diagonal: Vec<Triplet<usize, usize, f64>> =
            (0..dim).map(|i| Triplet::new(i, i, lambda)).collect();
        let damping = SparseColMat::try_new_from_triplets(dim, dim, &diagonal).map_err(|e| {
            LinAlgError::SparseMatrixCreation(format!("{dim}x{dim} damping diagonal"))
                .log_with_source(e)
        })?;
        let damped = &jt_j + damping;

        let step = self.factorize_and_solve(&damped, &jt_r)?;
        self.keep(jt_j, jt_r);
        Ok(step)
    }

    fn get_hessian(&self) -> Option<&SparseColMat<usize, f64>> {
        self.hessian.as_ref()
    }

    fn get_gradient(&self) -> Option<&Mat<f64>> {
        self.gradient.as_ref()
    }

    fn marginal_covariances(&self, block_size: usize) -> Option<Vec<Mat<f64>>> {
        let factorizer = self.factorizer.as_ref()?;
        let n = self.hessian.as_ref()?.ncols();
        if block_size == 0 || n % block_size != 0 {
            return None;
        }

        // one block column of H⁻¹ per solve keeps memory at n × block_size
        let blocks = (0..n / block_size)
            .map(|b| {
                let start = b * block_size;
                let rhs = Mat::from_fn(n, block_size, |i, j| if i == start + j { 1.0 } else { 0.0 });
                let columns = factorizer.solve(&rhs);
                Mat::from_fn(block_size, block_size, |i, j| columns[(start + i, j)])
            })
            .collect();
        Some(blocks)
    }
}
