/// Arithmetic mean of `values`, `NaN` when empty
///
/// # Examples
///
/// ```
/// use isotopomer::math::mean;
///
/// assert_eq!(mean(&[1.5, 2.5, 5.0]), 3.0);
/// assert!(mean(&[]).is_nan());
/// ```
#[allow(clippy::cast_precision_loss)]
pub fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Unbiased sample variance of `values`
///
/// Uses `n - 1` degrees of freedom. Fewer than two values carry no spread, so the variance is 0.
#[allow(clippy::cast_precision_loss)]
pub fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.;
    }
    let mean = mean(values);
    values.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

/// Sample standard deviation of `values`, see [`sample_variance`]
pub fn sample_std(values: &[f64]) -> f64 {
    sample_variance(values).sqrt()
}

#[cfg(test)]
mod tests {
    use super::{mean, sample_std, sample_variance};

    use ndarray::Array;
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Normal;
    use ndarray_rand::RandomExt;
    use rand_isaac::isaac64::Isaac64Rng;

    #[test]
    fn sample_statistics_match_hand_computed_values() {
        let values = [2., 4., 4., 4., 5., 5., 7., 9.];
        approx::assert_relative_eq!(mean(&values), 5.);
        approx::assert_relative_eq!(sample_variance(&values), 32. / 7., max_relative = 1e-12);
        approx::assert_relative_eq!(sample_std(&values), (32f64 / 7.).sqrt(), max_relative = 1e-12);
    }

    #[test]
    fn single_values_have_no_spread() {
        approx::assert_relative_eq!(sample_std(&[0.17]), 0.);
        approx::assert_relative_eq!(sample_variance(&[]), 0.);
    }

    #[test]
    fn large_normal_samples_recover_the_distribution_parameters() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let values = Array::random_using(20_000, Normal::new(0.17, 0.01).unwrap(), &mut rng);
        let values = values.to_vec();

        approx::assert_relative_eq!(mean(&values), 0.17, max_relative = 5e-3);
        approx::assert_relative_eq!(sample_std(&values), 0.01, max_relative = 5e-2);
    }
}
