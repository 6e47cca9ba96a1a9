// ========================================================================================
//
//                        COCHRAN-ARMITAGE TREND TEST
//
// ========================================================================================
//
// Tests for a monotonic association between an ordered categorical exposure (the
// genotype categories at a locus) and a binary outcome (case/control), using a 2×k
// table and an integer weight per column.
//
//     T   = Σ_j w_j·(n1j·N0 − n0j·N1)
//     Var = N0·N1·(Σ_j w_j²·c_j − (Σ_j w_j·c_j)² / N)
//     Z   = T / √Var,      p = 2·(1 − Φ(|Z|)) = erfc(|Z| / √2)
//
// Row 0 holds controls and row 1 holds cases, so a positive Z means the weighted
// categories are enriched in cases. Degenerate tables (an empty row, or all
// observations in columns sharing one weight) have no variance; the test reports
// NaN for both outputs and never panics.

use statrs::function::erf::erfc;
use std::f64::consts::SQRT_2;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrendTestError {
    #[error("The table has {controls} control columns but {cases} case columns.")]
    RaggedTable { controls: usize, cases: usize },
    #[error("The weight vector has {weights} entries but the table has {columns} columns.")]
    WeightLength { weights: usize, columns: usize },
}

/// The outcome of one trend test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendResult {
    /// The standardized statistic Z.
    pub statistic: f64,
    /// Two-sided p-value; NaN when the table is degenerate.
    pub p_value: f64,
}

impl TrendResult {
    const DEGENERATE: TrendResult = TrendResult {
        statistic: f64::NAN,
        p_value: f64::NAN,
    };

    pub fn is_degenerate(&self) -> bool {
        self.p_value.is_nan()
    }

    /// The p-value to persist: a degenerate test carries no evidence, so NaN
    /// becomes 1.0.
    pub fn emitted_p_value(&self) -> f64 {
        if self.p_value.is_nan() {
            1.0
        } else {
            self.p_value
        }
    }
}

/// Weight 0 for the first (majority) column and 1 for every other column: a
/// binary "any minor category" grouping rather than additive dosage.
pub fn default_weights(columns: usize) -> Vec<i32> {
    (0..columns).map(|j| if j == 0 { 0 } else { 1 }).collect()
}

/// Runs the Cochran-Armitage trend test on a 2×k table.
///
/// The variance is `N0·N1·(Σw²c − (Σwc)²/N)`, under which `Z` is standard
/// normal under the null and `Z²` equals the trend chi-square. Scaling it by a
/// further `1/N` would inflate `Z` by `√N`.
pub fn cochran_armitage(
    controls: &[u32],
    cases: &[u32],
    weights: &[i32],
) -> Result<TrendResult, TrendTestError> {
    if controls.len() != cases.len() {
        return Err(TrendTestError::RaggedTable {
            controls: controls.len(),
            cases: cases.len(),
        });
    }
    if weights.len() != controls.len() {
        return Err(TrendTestError::WeightLength {
            weights: weights.len(),
            columns: controls.len(),
        });
    }

    let n0: f64 = controls.iter().map(|&c| c as f64).sum();
    let n1: f64 = cases.iter().map(|&c| c as f64).sum();
    let n = n0 + n1;
    if n0 == 0.0 || n1 == 0.0 {
        return Ok(TrendResult::DEGENERATE);
    }

    let mut t = 0.0;
    let mut sum_w2c = 0.0;
    let mut sum_wc = 0.0;
    for ((&control, &case), &weight) in controls.iter().zip(cases).zip(weights) {
        let w = weight as f64;
        let (n0j, n1j) = (control as f64, case as f64);
        let column_total = n0j + n1j;
        t += w * (n1j * n0 - n0j * n1);
        sum_w2c += w * w * column_total;
        sum_wc += w * column_total;
    }

    let variance = n0 * n1 * (sum_w2c - sum_wc * sum_wc / n);
    // Exact zeros can come out as rounding noise for large tables.
    if !(variance > f64::EPSILON * n0 * n1 * sum_w2c.max(1.0)) {
        return Ok(TrendResult::DEGENERATE);
    }

    let statistic = t / variance.sqrt();
    let p_value = erfc(statistic.abs() / SQRT_2);
    Ok(TrendResult { statistic, p_value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn strong_het_enrichment_gives_large_positive_statistic() {
        // REF: 80 controls, 20 cases; HET: 20 controls, 80 cases.
        let result = cochran_armitage(&[80, 20], &[20, 80], &[0, 1]).unwrap();
        assert!(result.statistic > 5.0);
        assert!(result.p_value < 1e-10);
        // For a 2×2 table Z² equals the Pearson chi-square statistic (72 here).
        assert_relative_eq!(result.statistic * result.statistic, 72.0, epsilon = 1e-9);
    }

    #[test]
    fn swapping_rows_negates_the_statistic() {
        let forward = cochran_armitage(&[50, 30, 20], &[40, 35, 25], &[0, 1, 1]).unwrap();
        let swapped = cochran_armitage(&[40, 35, 25], &[50, 30, 20], &[0, 1, 1]).unwrap();
        assert_relative_eq!(forward.statistic, -swapped.statistic, epsilon = 1e-12);
        assert_relative_eq!(forward.p_value, swapped.p_value, epsilon = 1e-12);
    }

    #[test]
    fn identical_rows_give_no_evidence() {
        let result = cochran_armitage(&[10, 5, 1], &[10, 5, 1], &[0, 1, 1]).unwrap();
        assert_relative_eq!(result.statistic, 0.0);
        assert_relative_eq!(result.p_value, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn p_value_matches_normal_tail() {
        // Z = 1.959964 should give p ≈ 0.05.
        let z: f64 = 1.959_963_984_540_054;
        assert_relative_eq!(erfc(z / SQRT_2), 0.05, epsilon = 1e-12);
    }

    #[test]
    fn degenerate_tables_yield_nan_not_errors() {
        let empty_cases = cochran_armitage(&[10, 5], &[0, 0], &[0, 1]).unwrap();
        assert!(empty_cases.is_degenerate());
        assert!(empty_cases.statistic.is_nan());
        assert_eq!(empty_cases.emitted_p_value(), 1.0);

        let empty_controls = cochran_armitage(&[0, 0], &[3, 4], &[0, 1]).unwrap();
        assert!(empty_controls.is_degenerate());

        let single_column = cochran_armitage(&[12, 0, 0], &[7, 0, 0], &[0, 1, 1]).unwrap();
        assert!(single_column.is_degenerate());

        let lone_category = cochran_armitage(&[12], &[7], &[0]).unwrap();
        assert!(lone_category.is_degenerate());

        let nothing = cochran_armitage(&[], &[], &[]).unwrap();
        assert!(nothing.is_degenerate());
    }

    #[test]
    fn mismatched_shapes_are_reported() {
        assert_eq!(
            cochran_armitage(&[1, 2], &[1], &[0, 1]),
            Err(TrendTestError::RaggedTable {
                controls: 2,
                cases: 1
            })
        );
        assert_eq!(
            cochran_armitage(&[1, 2], &[1, 2], &[0]),
            Err(TrendTestError::WeightLength {
                weights: 1,
                columns: 2
            })
        );
    }

    #[test]
    fn default_weights_group_minor_categories() {
        assert_eq!(default_weights(0), Vec::<i32>::new());
        assert_eq!(default_weights(1), vec![0]);
        assert_eq!(default_weights(4), vec![0, 1, 1, 1]);
    }
}
