//! Behavior in the regime where per-component likelihoods underflow the
//! linear floating-point range. Log mode must stay exact; linear mode
//! reports an exact zero density; posteriors stay normalized in both modes.

use gmix::{Covariance, EvalOptions, Mixture, Output, evaluate};
use ndarray::{arr1, arr2};

fn far_apart_mixture() -> Mixture {
    Mixture::new(
        arr2(&[[0.0, 0.0], [5.0, 0.0]]),
        Covariance::SharedIsotropic(1.0),
        arr1(&[0.5, 0.5]),
    )
    .expect("mixture should validate")
}

#[test]
fn linear_density_underflows_to_exact_zero_far_from_all_components() {
    // Squared distance ~ 4e6 puts the exponent near -2e6, far below the
    // smallest positive double.
    let mixture = far_apart_mixture();
    let query = arr2(&[[2000.0, 0.0]]);
    let out = evaluate(
        query.view(),
        &mixture,
        &EvalOptions::default(),
        Output::Likelihood,
    )
    .expect("evaluation should succeed");

    assert_eq!(out.density[0], 0.0);
    let lik = out.likelihood.expect("likelihood requested");
    assert!(lik.row(0).iter().all(|&p| p == 0.0));
}

#[test]
fn log_density_stays_exact_where_linear_mode_underflows() {
    let mixture = far_apart_mixture();
    let query = arr2(&[[2000.0, 0.0]]);
    let out = evaluate(
        query.view(),
        &mixture,
        &EvalOptions::log(),
        Output::Density,
    )
    .expect("evaluation should succeed");

    // The nearer component dominates: log p(x) ≈ log(w) + log-kernel of the
    // component at (5, 0), with the 2π normalization for D = 2.
    let dist_sq = (2000.0_f64 - 5.0).powi(2);
    let expected = 0.5_f64.ln() - 0.5 * dist_sq - (2.0 * std::f64::consts::PI).ln();
    assert!(
        (out.density[0] - expected).abs() < 1e-6 * expected.abs(),
        "log density {} vs dominant-component approximation {expected}",
        out.density[0]
    );
    assert!(out.density[0].is_finite());
}

#[test]
fn posterior_survives_total_linear_underflow_in_both_modes() {
    let mixture = far_apart_mixture();
    // Closer to the second component, but far enough that both raw
    // likelihoods are exactly zero in linear arithmetic.
    let query = arr2(&[[1200.0, 0.0]]);
    for options in [EvalOptions::default(), EvalOptions::log()] {
        let out = evaluate(query.view(), &mixture, &options, Output::Posterior)
            .expect("evaluation should succeed");
        let posterior = out.posterior.expect("posterior requested");
        let total: f64 = posterior.row(0).sum();
        assert!(
            (total - 1.0).abs() < 1e-12,
            "posterior row sums to {total} (log={})",
            options.log_output
        );
        // The nearer component takes essentially all of the mass.
        assert!(posterior[[0, 1]] > 0.999_999);
    }
}

#[test]
fn zero_weight_component_gets_zero_posterior_mass() {
    let mixture = Mixture::new(
        arr2(&[[0.0, 0.0], [1.0, 0.0]]),
        Covariance::SharedIsotropic(1.0),
        arr1(&[1.0, 0.0]),
    )
    .expect("mixture should validate");
    let query = arr2(&[[0.5, 0.2]]);
    let out = evaluate(
        query.view(),
        &mixture,
        &EvalOptions::default(),
        Output::Posterior,
    )
    .expect("evaluation should succeed");
    let posterior = out.posterior.expect("posterior requested");
    assert_eq!(posterior[[0, 1]], 0.0);
    assert!((posterior[[0, 0]] - 1.0).abs() < 1e-15);
}

#[test]
fn overflowing_distance_yields_nan_posterior_and_zero_linear_density() {
    // At 1e200 the squared distance overflows to +∞: every kernel entry is
    // -∞ and no relative comparison between components remains. The
    // posterior row is explicitly NaN rather than an arbitrary direction.
    let mixture = far_apart_mixture();
    let query = arr2(&[[1e200, 0.0]]);
    let out = evaluate(
        query.view(),
        &mixture,
        &EvalOptions::default(),
        Output::Posterior,
    )
    .expect("evaluation should succeed");
    assert_eq!(out.density[0], 0.0);
    let posterior = out.posterior.expect("posterior requested");
    assert!(posterior.row(0).iter().all(|v| v.is_nan()));
}
