//! Percentile-bootstrap confidence intervals.
//!
//! Every call owns its generator, seeded from the configured value, so
//! concurrent bucket evaluations cannot perturb each other's streams and
//! a re-run with the same seed and input ordering reproduces identical
//! bounds bit for bit.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::EvalError;
use crate::stats;

pub const METHOD_BOOTSTRAP_PERCENTILE: &str = "bootstrap_percentile";
pub const METHOD_ORDERSTAT_BINOMIAL: &str = "orderstat_binomial";

#[derive(Debug, Clone, Copy)]
pub struct BootstrapConfig {
    pub iterations: usize,
    pub confidence: f64,
    pub seed: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            iterations: 1000,
            confidence: 0.95,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CiBounds {
    pub ci_low: f64,
    pub ci_high: f64,
}

/// Resamples n-of-n with replacement and returns the percentile interval
/// of the recomputed statistic. The resampling unit is whatever `samples`
/// holds (utterance-level scores for WER, per-utterance timings for
/// latency), never anything finer.
pub fn bootstrap_ci<T, F>(
    samples: &[T],
    statistic: F,
    config: &BootstrapConfig,
) -> Result<CiBounds, EvalError>
where
    T: Clone,
    F: Fn(&[T]) -> f64,
{
    if samples.is_empty() {
        return Err(EvalError::InsufficientData(
            "bootstrap requested over an empty sample set".to_string(),
        ));
    }
    if config.iterations == 0 {
        return Err(EvalError::InvalidInput(
            "bootstrap iteration count must be positive".to_string(),
        ));
    }
    if config.confidence <= 0.0 || config.confidence >= 1.0 {
        return Err(EvalError::InvalidInput(format!(
            "bootstrap confidence must be in (0, 1), got {}",
            config.confidence
        )));
    }

    let n = samples.len();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut resample = Vec::with_capacity(n);
    let mut distribution = Vec::with_capacity(config.iterations);

    for _ in 0..config.iterations {
        resample.clear();
        for _ in 0..n {
            resample.push(samples[rng.random_range(0..n)].clone());
        }
        distribution.push(statistic(&resample));
    }

    distribution.sort_unstable_by(|left, right| left.total_cmp(right));
    let alpha = (1.0 - config.confidence) / 2.0;
    let ci_low = stats::quantile_sorted(&distribution, alpha);
    let ci_high = stats::quantile_sorted(&distribution, 1.0 - alpha);

    match (ci_low, ci_high) {
        (Some(ci_low), Some(ci_high)) => Ok(CiBounds { ci_low, ci_high }),
        _ => Err(EvalError::InsufficientData(
            "bootstrap distribution produced no quantiles".to_string(),
        )),
    }
}

pub fn bootstrap_mean_ci(values: &[f64], config: &BootstrapConfig) -> Result<CiBounds, EvalError> {
    bootstrap_ci(values, |sample| stats::mean(sample).unwrap_or(0.0), config)
}

pub fn bootstrap_quantile_ci(
    values: &[f64],
    q: f64,
    config: &BootstrapConfig,
) -> Result<CiBounds, EvalError> {
    bootstrap_ci(
        values,
        |sample| stats::quantile(sample, q).unwrap_or(0.0),
        config,
    )
}
