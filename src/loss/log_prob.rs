//! Gaussian log-densities of every true slot under every candidate slot.

use ndarray::{Array3, ArrayView3};

use crate::error::{BlissError, Result};
use crate::posterior::VARIANCE_FLOOR;

const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Log-density of `x` under `N(mean, exp(log_var) + VARIANCE_FLOOR)`.
pub fn normal_log_prob(x: f64, mean: f64, log_var: f64) -> f64 {
    let var = log_var.exp() + VARIANCE_FLOOR;
    let z = x - mean;
    -0.5 * (LN_2PI + var.ln() + z * z / var)
}

/// `out[t, i, j] = Σ_d log N(truth[t, j, d]; mean[t, i, d], var[t, i, d])`.
///
/// Row `i` is the candidate slot, column `j` the true slot. All three inputs
/// are `[n_tiles, max_detections, dim]`.
pub fn log_probs_all_combs(
    truth: ArrayView3<f64>,
    mean: ArrayView3<f64>,
    log_var: ArrayView3<f64>,
) -> Result<Array3<f64>> {
    if truth.dim() != mean.dim() || mean.dim() != log_var.dim() {
        return Err(BlissError::shape(
            "true vs. predicted parameters",
            truth.dim(),
            (mean.dim(), log_var.dim()),
        ));
    }

    let (n_tiles, m, dim) = truth.dim();
    let mut out = Array3::<f64>::zeros((n_tiles, m, m));
    for t in 0..n_tiles {
        for i in 0..m {
            for j in 0..m {
                out[[t, i, j]] = (0..dim)
                    .map(|d| normal_log_prob(truth[[t, j, d]], mean[[t, i, d]], log_var[[t, i, d]]))
                    .sum();
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_normal_density() {
        // log_var such that var == 1 exactly.
        let lv = (1.0 - VARIANCE_FLOOR).ln();
        let lp = normal_log_prob(0.0, 0.0, lv);
        assert!((lp - (-0.5 * LN_2PI)).abs() < 1e-12);
        let lp1 = normal_log_prob(1.0, 0.0, lv);
        assert!((lp1 - (-0.5 * LN_2PI - 0.5)).abs() < 1e-12);
    }

    #[test]
    fn test_all_combs_layout() {
        // Two candidates, two truths, 1-d parameters.
        let truth = Array3::from_shape_vec((1, 2, 1), vec![0.0, 10.0]).unwrap();
        let mean = Array3::from_shape_vec((1, 2, 1), vec![10.0, 0.0]).unwrap();
        let lv = Array3::zeros((1, 2, 1));
        let lp = log_probs_all_combs(truth.view(), mean.view(), lv.view()).unwrap();
        // Candidate 0 (mean 10) fits truth 1; candidate 1 (mean 0) fits truth 0.
        assert!(lp[[0, 0, 1]] > lp[[0, 0, 0]]);
        assert!(lp[[0, 1, 0]] > lp[[0, 1, 1]]);
        assert!((lp[[0, 0, 1]] - lp[[0, 1, 0]]).abs() < 1e-12);
    }

    #[test]
    fn test_sums_over_dims() {
        let truth = Array3::from_elem((1, 1, 3), 0.5);
        let mean = Array3::from_elem((1, 1, 3), 0.5);
        let lv = Array3::zeros((1, 1, 3));
        let lp = log_probs_all_combs(truth.view(), mean.view(), lv.view()).unwrap();
        let single = normal_log_prob(0.5, 0.5, 0.0);
        assert!((lp[[0, 0, 0]] - 3.0 * single).abs() < 1e-12);
    }

    #[test]
    fn test_shape_mismatch() {
        let truth = Array3::zeros((1, 2, 2));
        let mean = Array3::zeros((1, 2, 3));
        let lv = Array3::zeros((1, 2, 3));
        assert!(log_probs_all_combs(truth.view(), mean.view(), lv.view()).is_err());
    }
}
