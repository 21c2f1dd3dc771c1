//! Covariance-type dispatch: the adjusted log-kernel.
//!
//! For N query points against M components this produces the N×M matrix of
//! Gaussian quadratic-form exponents, each entry already offset by its
//! component's `-½ log|Σ|` normalization. The shared `-(D/2)·log 2π` term is
//! excluded here and applied once downstream. Every output quantity of the
//! engine is derived from this one matrix.
//!
//! Full covariances are handled through a self-adjoint eigendecomposition
//! rather than explicit inversion: rotating the centered query into the
//! eigenbasis and scaling each axis by `1/sqrt(2λ)` is better conditioned
//! for near-singular matrices and yields the log-determinant as a
//! byproduct.

use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::evaluate::EvaluationError;
use crate::faer_ndarray::FaerEigh;
use crate::types::{Covariance, Mixture};

/// Squared Euclidean distance between every row of `x` and every row of `c`.
fn pairwise_sq_dist(x: ArrayView2<'_, f64>, c: ArrayView2<'_, f64>) -> Array2<f64> {
    let mut out = Array2::zeros((x.nrows(), c.nrows()));
    for (i, xi) in x.rows().into_iter().enumerate() {
        for (j, cj) in c.rows().into_iter().enumerate() {
            let mut acc = 0.0;
            for (a, b) in xi.iter().zip(cj.iter()) {
                let t = a - b;
                acc += t * t;
            }
            out[[i, j]] = acc;
        }
    }
    out
}

#[inline]
fn ensure_positive(value: f64, what: impl Fn() -> String) -> Result<f64, EvaluationError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(EvaluationError::DegenerateCovariance(format!(
            "{} is {value:.3e}, expected a positive finite variance",
            what()
        )))
    }
}

/// Eigenbasis of one full covariance matrix, prepared for kernel use.
struct EigenBasis {
    vectors: Array2<f64>,
    /// Per-axis factor `1/sqrt(2λ_k)`.
    inv_scale: Array1<f64>,
    /// `-½ Σ log λ_k`.
    log_norm: f64,
}

fn eigen_basis(sigma: &Array2<f64>, label: &str) -> Result<EigenBasis, EvaluationError> {
    let (values, vectors) = sigma.eigh(Side::Lower)?;
    let d = values.len();
    let mut inv_scale = Array1::zeros(d);
    let mut log_det = 0.0;
    for (k, &lambda) in values.iter().enumerate() {
        if !(lambda.is_finite() && lambda > 0.0) {
            return Err(EvaluationError::DegenerateCovariance(format!(
                "{label}: eigenvalue {k} is {lambda:.3e}, matrix is not positive definite"
            )));
        }
        log_det += lambda.ln();
        inv_scale[k] = 1.0 / (2.0 * lambda).sqrt();
    }
    Ok(EigenBasis {
        vectors,
        inv_scale,
        log_norm: -0.5 * log_det,
    })
}

/// One kernel column: rotate the centered query into the eigenbasis, scale
/// each axis, accumulate the negative sum of squares.
fn full_exponent_column(
    query: ArrayView2<'_, f64>,
    centroid: ArrayView1<'_, f64>,
    basis: &EigenBasis,
) -> Array1<f64> {
    let diff = &query - &centroid;
    let proj = diff.dot(&basis.vectors);
    let mut col = Array1::zeros(query.nrows());
    for (i, mut_ref) in col.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (k, &s) in basis.inv_scale.iter().enumerate() {
            let t = proj[[i, k]] * s;
            acc += t * t;
        }
        *mut_ref = basis.log_norm - acc;
    }
    col
}

/// Compute the N×M adjusted log-kernel for `query` against `mixture`.
///
/// The per-component loop of the full-covariance path runs under rayon once
/// the component count reaches `parallel_threshold`; parallelism never
/// changes the per-row reduction order used downstream.
pub fn adjusted_log_kernel(
    query: ArrayView2<'_, f64>,
    mixture: &Mixture,
    parallel_threshold: usize,
) -> Result<Array2<f64>, EvaluationError> {
    let n = query.nrows();
    let m = mixture.n_components();
    let d = mixture.dim();
    debug_assert_eq!(query.ncols(), d);
    log::debug!(
        "adjusted log-kernel: {n} points × {m} components, dim {d}, {:?}",
        mixture.covariance().kind()
    );

    match mixture.covariance() {
        Covariance::SharedIsotropic(var) => {
            let var = ensure_positive(*var, || "shared isotropic variance".to_string())?;
            let log_norm = -0.5 * d as f64 * var.ln();
            let inv_two_var = 1.0 / (2.0 * var);
            let mut kernel = pairwise_sq_dist(query, mixture.centroids().view());
            kernel.mapv_inplace(|sq| log_norm - sq * inv_two_var);
            Ok(kernel)
        }
        Covariance::Isotropic(vars) => {
            let mut kernel = pairwise_sq_dist(query, mixture.centroids().view());
            for (j, &var) in vars.iter().enumerate() {
                let var =
                    ensure_positive(var, || format!("isotropic variance of component {j}"))?;
                let log_norm = -0.5 * d as f64 * var.ln();
                let inv_two_var = 1.0 / (2.0 * var);
                kernel
                    .column_mut(j)
                    .mapv_inplace(|sq| log_norm - sq * inv_two_var);
            }
            Ok(kernel)
        }
        Covariance::SharedDiagonal(vars) => {
            // Rescaling both query and centroids by 1/sqrt(2σ²) per axis
            // turns the per-axis quadratic into a plain squared distance.
            let mut log_det = 0.0;
            let mut scale = Array1::zeros(d);
            for (k, &var) in vars.iter().enumerate() {
                let var =
                    ensure_positive(var, || format!("shared diagonal variance on axis {k}"))?;
                log_det += var.ln();
                scale[k] = 1.0 / (2.0 * var).sqrt();
            }
            let log_norm = -0.5 * log_det;
            let scaled_query = &query * &scale;
            let scaled_centroids = mixture.centroids() * &scale;
            let mut kernel = pairwise_sq_dist(scaled_query.view(), scaled_centroids.view());
            kernel.mapv_inplace(|sq| log_norm - sq);
            Ok(kernel)
        }
        Covariance::Diagonal(vars) => {
            let centroids = mixture.centroids();
            let mut kernel = Array2::zeros((n, m));
            let mut inv_two_var = Array1::zeros(d);
            for j in 0..m {
                let centroid = centroids.row(j);
                let mut log_det = 0.0;
                for (k, &var) in vars.row(j).iter().enumerate() {
                    let var = ensure_positive(var, || {
                        format!("diagonal variance of component {j} on axis {k}")
                    })?;
                    log_det += var.ln();
                    inv_two_var[k] = 1.0 / (2.0 * var);
                }
                let log_norm = -0.5 * log_det;
                for i in 0..n {
                    let mut acc = 0.0;
                    for k in 0..d {
                        let t = query[[i, k]] - centroid[k];
                        acc += t * t * inv_two_var[k];
                    }
                    kernel[[i, j]] = log_norm - acc;
                }
            }
            Ok(kernel)
        }
        Covariance::SharedFull(sigma) => {
            // One decomposition, reused for every component.
            let basis = eigen_basis(sigma, "shared covariance")?;
            let centroids = mixture.centroids();
            let mut kernel = Array2::zeros((n, m));
            for j in 0..m {
                let col = full_exponent_column(query, centroids.row(j), &basis);
                kernel.column_mut(j).assign(&col);
            }
            Ok(kernel)
        }
        Covariance::Full(sigmas) => {
            let centroids = mixture.centroids();
            let column_for = |j: usize| -> Result<Array1<f64>, EvaluationError> {
                let basis = eigen_basis(&sigmas[j], &format!("covariance of component {j}"))?;
                Ok(full_exponent_column(query, centroids.row(j), &basis))
            };
            let columns: Result<Vec<Array1<f64>>, EvaluationError> = if m >= parallel_threshold
            {
                (0..m).into_par_iter().map(column_for).collect()
            } else {
                (0..m).map(column_for).collect()
            };
            let columns = columns?;
            let mut kernel = Array2::zeros((n, m));
            for (j, col) in columns.into_iter().enumerate() {
                kernel.column_mut(j).assign(&col);
            }
            Ok(kernel)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn query_3x2() -> Array2<f64> {
        arr2(&[[0.0, 0.0], [1.0, -0.5], [-2.0, 0.25]])
    }

    fn max_abs_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
        (a - b).iter().fold(0.0f64, |acc, &x| acc.max(x.abs()))
    }

    #[test]
    fn unit_isotropic_kernel_is_half_squared_distance() {
        let mixture = Mixture::new(
            arr2(&[[0.0, 0.0], [1.0, 1.0]]),
            Covariance::SharedIsotropic(1.0),
            arr1(&[0.5, 0.5]),
        )
        .expect("mixture should validate");
        let query = query_3x2();
        let kernel = adjusted_log_kernel(query.view(), &mixture, 8).expect("kernel");

        let dist = pairwise_sq_dist(query.view(), mixture.centroids().view());
        for (k, sq) in kernel.iter().zip(dist.iter()) {
            assert!((k - (-0.5 * sq)).abs() < 1e-14);
        }
    }

    #[test]
    fn shared_diagonal_rescaling_matches_direct_quadratic() {
        let vars = arr1(&[0.5, 3.0]);
        let centroids = arr2(&[[0.4, -1.0], [2.0, 0.3]]);
        let weights = arr1(&[0.6, 0.4]);
        let query = query_3x2();

        let shared = Mixture::new(
            centroids.clone(),
            Covariance::SharedDiagonal(vars.clone()),
            weights.clone(),
        )
        .expect("mixture should validate");
        // The same variances written out per component.
        let expanded = Mixture::new(
            centroids,
            Covariance::Diagonal(arr2(&[[0.5, 3.0], [0.5, 3.0]])),
            weights,
        )
        .expect("mixture should validate");

        let a = adjusted_log_kernel(query.view(), &shared, 8).expect("kernel");
        let b = adjusted_log_kernel(query.view(), &expanded, 8).expect("kernel");
        assert!(max_abs_diff(&a, &b) < 1e-12, "diff {:e}", max_abs_diff(&a, &b));
    }

    #[test]
    fn full_path_on_diagonal_matrices_matches_diagonal_path() {
        let centroids = arr2(&[[0.0, 1.0], [-1.0, 0.5]]);
        let weights = arr1(&[0.3, 0.7]);
        let query = query_3x2();

        let full = Mixture::new(
            centroids.clone(),
            Covariance::Full(vec![
                arr2(&[[0.8, 0.0], [0.0, 1.4]]),
                arr2(&[[2.0, 0.0], [0.0, 0.6]]),
            ]),
            weights.clone(),
        )
        .expect("mixture should validate");
        let diagonal = Mixture::new(
            centroids,
            Covariance::Diagonal(arr2(&[[0.8, 1.4], [2.0, 0.6]])),
            weights,
        )
        .expect("mixture should validate");

        let a = adjusted_log_kernel(query.view(), &full, 8).expect("kernel");
        let b = adjusted_log_kernel(query.view(), &diagonal, 8).expect("kernel");
        assert!(max_abs_diff(&a, &b) < 1e-10, "diff {:e}", max_abs_diff(&a, &b));
    }

    #[test]
    fn parallel_and_serial_full_paths_agree() {
        let centroids = arr2(&[[0.0, 0.0], [1.0, 2.0], [-1.5, 0.5]]);
        let sigma = arr2(&[[1.0, 0.3], [0.3, 0.9]]);
        let mixture = Mixture::new(
            centroids,
            Covariance::Full(vec![sigma.clone(), sigma.clone(), sigma]),
            arr1(&[0.2, 0.3, 0.5]),
        )
        .expect("mixture should validate");
        let query = query_3x2();

        let serial = adjusted_log_kernel(query.view(), &mixture, usize::MAX).expect("kernel");
        let parallel = adjusted_log_kernel(query.view(), &mixture, 1).expect("kernel");
        assert_eq!(serial, parallel);
    }

    #[test]
    fn non_positive_definite_matrix_is_rejected() {
        // Eigenvalues 3 and -1.
        let mixture = Mixture::new(
            arr2(&[[0.0, 0.0]]),
            Covariance::Full(vec![arr2(&[[1.0, 2.0], [2.0, 1.0]])]),
            arr1(&[1.0]),
        )
        .expect("mixture should validate");
        let query = query_3x2();
        let result = adjusted_log_kernel(query.view(), &mixture, 8);
        assert!(matches!(
            result,
            Err(EvaluationError::DegenerateCovariance(_))
        ));
    }

    #[test]
    fn zero_variance_is_rejected() {
        let mixture = Mixture::new(
            arr2(&[[0.0, 0.0]]),
            Covariance::Diagonal(arr2(&[[1.0, 0.0]])),
            arr1(&[1.0]),
        )
        .expect("mixture should validate");
        let result = adjusted_log_kernel(query_3x2().view(), &mixture, 8);
        assert!(matches!(
            result,
            Err(EvaluationError::DegenerateCovariance(_))
        ));
    }
}
