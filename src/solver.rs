use std::time::Instant;

use log::{debug, trace};
use nalgebra::{ComplexField, DMatrix, DVector};

use crate::error::{CircuitError, Result};

/// Solver configuration
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Smallest accepted |pivot| once each row is scaled to a largest entry of 1
    pub pivot_tolerance: f64,
    /// Relative residual above which a solve is rejected
    pub residual_tolerance: f64,
    pub check_residual: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            pivot_tolerance: 1e-13,
            residual_tolerance: 1e-9,
            check_residual: true,
        }
    }
}

/// Solver statistics
#[derive(Debug, Clone, PartialEq)]
pub struct SolverStats {
    pub size: usize,
    pub residual_norm: f64,
    /// Smallest |pivot| of the row-scaled factor
    pub pivot_ratio: f64,
    pub solve_time: f64,
}

/// Dense LU solver that refuses singular systems instead of returning
/// whatever the factorization produces.
#[derive(Debug, Clone, Default)]
pub struct LinearSolver {
    config: SolverConfig,
}

impl LinearSolver {
    /// Create a new solver with default configuration
    pub fn new() -> Self {
        LinearSolver {
            config: SolverConfig::default(),
        }
    }

    /// Create a new solver with custom configuration
    pub fn with_config(config: SolverConfig) -> Self {
        LinearSolver { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Solve the linear system Ax = b using LU decomposition
    pub fn solve_dense<T>(&self, matrix: &DMatrix<T>, rhs: &DVector<T>) -> Result<(DVector<T>, SolverStats)>
    where
        T: ComplexField<RealField = f64>,
    {
        let start_time = Instant::now();

        if matrix.nrows() != rhs.len() {
            return Err(CircuitError::singular(format!(
                "matrix has {} rows but right-hand side has {} entries",
                matrix.nrows(),
                rhs.len()
            )));
        }

        let (scaled, row_scale) = equilibrate(matrix)?;
        let mut scaled_rhs = rhs.clone();
        for (value, &s) in scaled_rhs.iter_mut().zip(&row_scale) {
            *value = value.clone() * T::from_real(s);
        }

        let lu = scaled.clone().lu();
        let pivot_ratio = self.check_pivots(&lu.u())?;
        let solution = lu
            .solve(&scaled_rhs)
            .ok_or_else(|| CircuitError::singular("LU decomposition failed - matrix is singular"))?;

        let residual_norm = (&scaled * &solution - &scaled_rhs).norm();
        if self.config.check_residual {
            let scale = 1.0 + scaled_rhs.norm();
            if !(residual_norm <= self.config.residual_tolerance * scale) {
                return Err(CircuitError::singular(format!(
                    "residual {:.3e} too large - matrix is numerically singular",
                    residual_norm
                )));
            }
        }

        let stats = SolverStats {
            size: matrix.nrows(),
            residual_norm,
            pivot_ratio,
            solve_time: start_time.elapsed().as_secs_f64(),
        };
        trace!("Dense solve: {:?}", stats);
        Ok((solution, stats))
    }

    /// Invert a square matrix, failing on (numerical) singularity
    pub fn invert<T>(&self, matrix: &DMatrix<T>) -> Result<DMatrix<T>>
    where
        T: ComplexField<RealField = f64>,
    {
        let (scaled, row_scale) = equilibrate(matrix)?;
        let lu = scaled.lu();
        let pivot_ratio = self.check_pivots(&lu.u())?;
        debug!(
            "Inverting {}x{} system (pivot ratio {:.3e})",
            matrix.nrows(),
            matrix.ncols(),
            pivot_ratio
        );
        let mut inverse = lu
            .try_inverse()
            .ok_or_else(|| CircuitError::singular("LU decomposition failed - matrix is singular"))?;

        // inv(D·A)·D = inv(A)
        for (j, &s) in row_scale.iter().enumerate() {
            for value in inverse.column_mut(j).iter_mut() {
                *value = value.clone() * T::from_real(s);
            }
        }
        Ok(inverse)
    }

    /// Pivots of the row-equilibrated factor, where every row's largest entry is 1
    fn check_pivots<T>(&self, u: &DMatrix<T>) -> Result<f64>
    where
        T: ComplexField<RealField = f64>,
    {
        if u.nrows() == 0 {
            return Ok(1.0);
        }

        let min_pivot = u
            .diagonal()
            .iter()
            .map(|p| p.clone().modulus())
            .fold(f64::INFINITY, f64::min);

        if !(min_pivot > self.config.pivot_tolerance) {
            return Err(CircuitError::singular(format!(
                "smallest pivot {:.3e} after row scaling",
                min_pivot
            )));
        }
        Ok(min_pivot)
    }
}

/// Divide every row by its largest |entry|.
///
/// Constraint rows carry unit coefficients while KCL rows carry admittances,
/// so pivots are only comparable after this scaling.
fn equilibrate<T>(matrix: &DMatrix<T>) -> Result<(DMatrix<T>, Vec<f64>)>
where
    T: ComplexField<RealField = f64>,
{
    if matrix.nrows() != matrix.ncols() {
        return Err(CircuitError::singular(format!(
            "{} equations for {} unknowns",
            matrix.nrows(),
            matrix.ncols()
        )));
    }

    let mut scaled = matrix.clone();
    let mut row_scale = Vec::with_capacity(matrix.nrows());
    for i in 0..matrix.nrows() {
        let largest = matrix
            .row(i)
            .iter()
            .map(|x| x.clone().modulus())
            .fold(0.0f64, f64::max);
        if !(largest > 0.0) || !largest.is_finite() {
            return Err(CircuitError::singular(format!("equation {} has no usable coefficients", i)));
        }
        let s = 1.0 / largest;
        for value in scaled.row_mut(i).iter_mut() {
            *value = value.clone() * T::from_real(s);
        }
        row_scale.push(s);
    }
    Ok((scaled, row_scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use num_complex::Complex64;

    #[test]
    fn test_dense_lu_solver() {
        let solver = LinearSolver::new();

        // [2 1; 1 2] * [x; y] = [3; 3] has solution [1; 1]
        let matrix = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]);
        let rhs = DVector::from_vec(vec![3.0, 3.0]);

        let (solution, stats) = solver.solve_dense(&matrix, &rhs).unwrap();

        assert_relative_eq!(solution[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(solution[1], 1.0, epsilon = 1e-12);
        assert!(stats.residual_norm < 1e-12);
        assert_eq!(stats.size, 2);
    }

    #[test]
    fn test_complex_solve() {
        let solver = LinearSolver::new();
        let j = Complex64::new(0.0, 1.0);
        let one = Complex64::new(1.0, 0.0);

        // (1 + j) x = 2  =>  x = 1 - j
        let matrix = DMatrix::from_element(1, 1, one + j);
        let rhs = DVector::from_element(1, one * 2.0);
        let (solution, _) = solver.solve_dense(&matrix, &rhs).unwrap();
        assert_relative_eq!(solution[0].re, 1.0, epsilon = 1e-12);
        assert_relative_eq!(solution[0].im, -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_singular_matrix_rejected() {
        let solver = LinearSolver::new();
        let matrix = DMatrix::from_row_slice(2, 2, &[1.0, -1.0, 1.0, -1.0]);
        let rhs = DVector::from_vec(vec![5.0, 3.0]);
        assert!(matches!(
            solver.solve_dense(&matrix, &rhs),
            Err(CircuitError::SingularSystem { .. })
        ));
        assert!(solver.invert(&matrix).is_err());
    }

    #[test]
    fn test_zero_row_rejected() {
        let solver = LinearSolver::new();
        let matrix = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 0.0]);
        assert!(solver.invert(&matrix).is_err());
    }

    #[test]
    fn test_non_square_rejected() {
        let solver = LinearSolver::new();
        let matrix = DMatrix::<f64>::zeros(3, 2);
        assert!(solver.invert(&matrix).is_err());
    }

    #[test]
    fn test_mixed_row_scales_accepted() {
        let solver = LinearSolver::new();

        // unit constraint row next to rows in kS and 10 pS
        let matrix = DMatrix::from_row_slice(
            3,
            3,
            &[
                1.0, 0.0, 0.0,
                -1e3, 1e3 + 1e-11, -1e-11,
                0.0, -1e-11, 2e-11,
            ],
        );
        let rhs = DVector::from_vec(vec![1.0, 0.0, 0.0]);
        let (solution, stats) = solver.solve_dense(&matrix, &rhs).unwrap();
        assert_relative_eq!(solution[2], 0.5, epsilon = 1e-9);
        assert!(stats.pivot_ratio > 0.1);

        let inverse = solver.invert(&matrix).unwrap();
        assert_relative_eq!(&inverse * &rhs, solution, epsilon = 1e-9);
    }

    #[test]
    fn test_inverse() {
        let solver = LinearSolver::new();
        let matrix = DMatrix::from_row_slice(2, 2, &[4.0, 7.0, 2.0, 6.0]);
        let inverse = solver.invert(&matrix).unwrap();
        let identity = &matrix * &inverse;
        assert_relative_eq!(identity, DMatrix::identity(2, 2), epsilon = 1e-12);
    }
}
