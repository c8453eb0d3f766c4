//! Descriptive statistics shared by the corpus aggregator and the
//! bootstrap engine. Quantiles use linear interpolation between order
//! statistics: rank = q * (n - 1), interpolated between the bracketing
//! ranks.

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(|left, right| left.total_cmp(right));
    quantile_sorted(&sorted, q)
}

/// `sorted` must already be in ascending order.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }

    let rank = q * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        return Some(sorted[low]);
    }

    let fraction = rank - low as f64;
    Some(sorted[low] + (sorted[high] - sorted[low]) * fraction)
}

/// Distribution-free confidence interval for the q-quantile, built from
/// the order statistics whose ranks bracket the Binomial(n, q) interval
/// (normal approximation to the binomial). Used for quantile metrics when
/// the sample is too small for resampling to be informative.
///
/// `sorted` must already be in ascending order.
pub fn order_statistic_ci(sorted: &[f64], q: f64, confidence: f64) -> Option<(f64, f64)> {
    if sorted.is_empty() {
        return None;
    }

    let n = sorted.len();
    let alpha = 1.0 - confidence;
    let z = normal_quantile(1.0 - alpha / 2.0)?;
    let mu = n as f64 * q;
    let sigma = (n as f64 * q * (1.0 - q)).sqrt().max(f64::EPSILON);

    let rank_low = ((mu - z * sigma).floor().max(1.0) as usize).min(n);
    let rank_high = ((mu + z * sigma).ceil().max(1.0) as usize).min(n);

    Some((sorted[rank_low - 1], sorted[rank_high - 1]))
}

/// Inverse standard-normal CDF via the Acklam rational approximation;
/// accurate to ~1e-9 over (0, 1), which is far below the granularity of
/// order-statistic ranks.
pub fn normal_quantile(p: f64) -> Option<f64> {
    if !(0.0..1.0).contains(&p) || p == 0.0 {
        return None;
    }

    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    let value = if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -((((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0))
    };

    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_five_samples_interpolates_linearly() {
        let samples = [10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(quantile(&samples, 0.5), Some(30.0));
    }

    #[test]
    fn p95_of_five_samples_interpolates_between_order_statistics() {
        let samples = [10.0, 20.0, 30.0, 40.0, 50.0];
        let p95 = quantile(&samples, 0.95).expect("quantile");
        assert!((p95 - 48.0).abs() < 1e-9, "p95 = {p95}");
    }

    #[test]
    fn quantile_handles_unsorted_input_and_bounds() {
        let samples = [50.0, 10.0, 40.0, 20.0, 30.0];
        assert_eq!(quantile(&samples, 0.0), Some(10.0));
        assert_eq!(quantile(&samples, 1.0), Some(50.0));
        assert_eq!(quantile(&samples, 0.5), Some(30.0));
        assert_eq!(quantile(&[], 0.5), None);
        assert_eq!(quantile(&samples, 1.5), None);
    }

    #[test]
    fn mean_of_empty_slice_is_none() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[2.0, 4.0]), Some(3.0));
    }

    #[test]
    fn normal_quantile_matches_known_values() {
        let z95 = normal_quantile(0.975).expect("z");
        assert!((z95 - 1.959964).abs() < 1e-5, "z95 = {z95}");
        let z50 = normal_quantile(0.5).expect("z");
        assert!(z50.abs() < 1e-9, "z50 = {z50}");
        let low = normal_quantile(0.01).expect("z");
        assert!((low + 2.326348).abs() < 1e-5, "z01 = {low}");
    }

    #[test]
    fn order_statistic_ci_brackets_the_median() {
        let sorted: Vec<f64> = (1..=20).map(f64::from).collect();
        let (low, high) = order_statistic_ci(&sorted, 0.5, 0.95).expect("ci");
        assert!(low <= 10.0 && high >= 11.0, "ci = ({low}, {high})");
        assert!(low >= 1.0 && high <= 20.0);
    }

    #[test]
    fn order_statistic_ci_on_empty_input_is_none() {
        assert_eq!(order_statistic_ci(&[], 0.5, 0.95), None);
    }
}
