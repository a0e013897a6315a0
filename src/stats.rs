//! Summary statistics over per-example scores.
//!
//! Used by the report to attach a seeded bootstrap interval to each model's
//! judge score and to test pairwise differences between models.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Settings for interval estimation and significance testing
#[derive(Debug, Clone, PartialEq)]
pub struct StatConfig {
    /// Bootstrap resamples
    pub bootstrap_n: usize,
    /// Confidence level (e.g. 0.95)
    pub confidence: f64,
    /// Significance threshold
    pub alpha: f64,
    /// Resampling seed, fixed so reports are reproducible
    pub seed: u64,
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            bootstrap_n: 10_000,
            confidence: 0.95,
            alpha: 0.05,
            seed: 42,
        }
    }
}

/// Arithmetic mean; 0.0 for no samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Sample standard deviation (n - 1); 0.0 below two samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn std_dev(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let m = mean(samples);
    let sum_sq: f64 = samples.iter().map(|x| (x - m).powi(2)).sum();
    (sum_sq / (samples.len() - 1) as f64).sqrt()
}

/// Percentile bootstrap interval for the mean.
///
/// Fewer than two samples collapse the interval onto the mean.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
)]
pub fn bootstrap_ci(samples: &[f64], config: &StatConfig) -> (f64, f64) {
    let m = mean(samples);
    if samples.len() < 2 || config.bootstrap_n == 0 {
        return (m, m);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let n = samples.len();
    let mut means: Vec<f64> = (0..config.bootstrap_n)
        .map(|_| {
            let total: f64 = (0..n).map(|_| samples[rng.gen_range(0..n)]).sum();
            total / n as f64
        })
        .collect();
    means.sort_by(f64::total_cmp);

    let tail = (1.0 - config.confidence) / 2.0;
    let last = means.len() - 1;
    let lower_idx = ((means.len() as f64 * tail).floor() as usize).min(last);
    let upper_idx = ((means.len() as f64 * (1.0 - tail)).ceil() as usize).min(last);

    (means[lower_idx], means[upper_idx])
}

/// Outcome of a two-sample significance test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceResult {
    /// t-statistic
    pub t_statistic: f64,
    /// Two-tailed p-value
    pub p_value: f64,
    /// Welch-Satterthwaite degrees of freedom
    pub degrees_of_freedom: f64,
    /// Whether `p_value < alpha`
    pub is_significant: bool,
    /// Cohen's d with pooled standard deviation
    pub cohens_d: f64,
    /// Effect size label
    pub effect_interpretation: String,
}

/// Welch's t-test for two independent samples.
///
/// Returns `None` when either side has fewer than two samples or both
/// sides have zero variance.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::suboptimal_flops)]
pub fn welch_t_test(samples_a: &[f64], samples_b: &[f64], alpha: f64) -> Option<SignificanceResult> {
    if samples_a.len() < 2 || samples_b.len() < 2 {
        return None;
    }

    let (n_a, n_b) = (samples_a.len() as f64, samples_b.len() as f64);
    let (mean_a, mean_b) = (mean(samples_a), mean(samples_b));
    let var_a = std_dev(samples_a).powi(2);
    let var_b = std_dev(samples_b).powi(2);

    let se_a = var_a / n_a;
    let se_b = var_b / n_b;
    let se = (se_a + se_b).sqrt();
    if se < f64::EPSILON {
        return None;
    }

    let t_statistic = (mean_a - mean_b) / se;
    let df_denom = se_a.powi(2) / (n_a - 1.0) + se_b.powi(2) / (n_b - 1.0);
    let df = if df_denom > f64::EPSILON {
        (se_a + se_b).powi(2) / df_denom
    } else {
        (n_a + n_b - 2.0).max(1.0)
    };

    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    let p_value = (2.0 * (1.0 - dist.cdf(t_statistic.abs()))).clamp(0.0, 1.0);

    let pooled = (((n_a - 1.0) * var_a + (n_b - 1.0) * var_b) / (n_a + n_b - 2.0)).sqrt();
    let cohens_d = if pooled > f64::EPSILON {
        (mean_a - mean_b) / pooled
    } else {
        0.0
    };

    Some(SignificanceResult {
        t_statistic,
        p_value,
        degrees_of_freedom: df,
        is_significant: p_value < alpha,
        cohens_d,
        effect_interpretation: interpret_cohens_d(cohens_d).to_string(),
    })
}

/// Conventional label for an effect size
#[must_use]
pub fn interpret_cohens_d(d: f64) -> &'static str {
    match d.abs() {
        x if x < 0.2 => "negligible",
        x if x < 0.5 => "small",
        x if x < 0.8 => "medium",
        _ => "large",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::cast_precision_loss)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_std() {
        assert_eq!(mean(&[]), 0.0);
        assert!((mean(&[1.0, 2.0, 3.0]) - 2.0).abs() < f64::EPSILON);

        let samples = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let s = std_dev(&samples);
        assert!(s > 2.0 && s < 2.2, "std = {s}");
        assert_eq!(std_dev(&[5.0]), 0.0);
    }

    #[test]
    fn test_bootstrap_ci_reproducible_and_contains_mean() {
        let samples: Vec<f64> = (0..200).map(|i| 0.5 + (i % 10) as f64 * 0.03).collect();
        let config = StatConfig {
            bootstrap_n: 2_000,
            ..StatConfig::default()
        };

        let first = bootstrap_ci(&samples, &config);
        let second = bootstrap_ci(&samples, &config);
        assert_eq!(first, second);

        let m = mean(&samples);
        assert!(first.0 <= m && m <= first.1, "{first:?} vs {m}");
        assert!(first.1 - first.0 < 0.1);
    }

    #[test]
    fn test_bootstrap_ci_degenerate() {
        let config = StatConfig::default();
        assert_eq!(bootstrap_ci(&[0.7], &config), (0.7, 0.7));
        assert_eq!(bootstrap_ci(&[], &config), (0.0, 0.0));
    }

    #[test]
    fn test_welch_detects_difference() {
        let a: Vec<f64> = (0..40).map(|i| 0.9 + (i % 4) as f64 * 0.01).collect();
        let b: Vec<f64> = (0..40).map(|i| 0.5 + (i % 4) as f64 * 0.01).collect();

        let result = welch_t_test(&a, &b, 0.05).unwrap();
        assert!(result.is_significant);
        assert!(result.t_statistic > 0.0);
        assert_eq!(result.effect_interpretation, "large");
    }

    #[test]
    fn test_welch_identical_samples_not_significant() {
        let a: Vec<f64> = (0..10).map(|i| i as f64 * 0.1).collect();
        let result = welch_t_test(&a, &a, 0.05).unwrap();
        assert!(!result.is_significant);
        assert!(result.p_value > 0.99);
    }

    #[test]
    fn test_welch_needs_two_samples_and_variance() {
        assert!(welch_t_test(&[0.9], &[0.8, 0.7], 0.05).is_none());
        assert!(welch_t_test(&[0.5, 0.5], &[0.5, 0.5], 0.05).is_none());
    }

    #[test]
    fn test_cohens_d_labels() {
        assert_eq!(interpret_cohens_d(0.1), "negligible");
        assert_eq!(interpret_cohens_d(-0.3), "small");
        assert_eq!(interpret_cohens_d(0.6), "medium");
        assert_eq!(interpret_cohens_d(-1.2), "large");
    }
}
