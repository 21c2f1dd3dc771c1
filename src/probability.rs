/// Natural logarithm of 2π.
pub const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Shared Gaussian normalization term `-(d/2)·log 2π` for dimension `d`.
///
/// The adjusted log-kernel deliberately excludes this constant; it is added
/// back exactly once when a likelihood or density is materialized.
#[inline]
pub fn log_norm_constant(dim: usize) -> f64 {
    -0.5 * dim as f64 * LN_2PI
}

/// Standard normal PDF φ(x).
#[inline]
pub fn normal_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}
