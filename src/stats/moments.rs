//! Running mean and variance
//!
//! Welford's single-pass algorithm, plus the exact inversion from the
//! persisted `(count, mean, std)` form back into `(count, mean, M2)`.

/// Running moments of one scalar stream
///
/// Tracks `count`, the running mean and `M2`, the sum of squared deviations
/// from the mean. Sample variance is `M2 / (count - 1)`; with one or zero
/// observations it is defined as `0`.
///
/// # Example
///
/// ```
/// use pairflow::stats::RunningMoments;
///
/// let mut m = RunningMoments::new();
/// for v in [100.0, 200.0] {
///     m.add(v);
/// }
///
/// assert_eq!(m.mean(), 150.0);
/// assert!((m.sample_stddev() - 70.710678118654755).abs() < 1e-9);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RunningMoments {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningMoments {
    /// Create a new empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an accumulator from its persisted summary
    ///
    /// Inverts [`to_summary`](Self::to_summary): `M2 = std² × max(1, count − 1)`.
    /// The inversion is exact up to the rounding already present in `std`.
    /// For `count <= 1` the stored std is 0 and so is the rebuilt `M2`.
    pub fn from_summary(count: u64, mean: f64, std: f64) -> Self {
        let dof = count.saturating_sub(1).max(1) as f64;
        Self {
            count,
            mean: if count == 0 { 0.0 } else { mean },
            m2: std * std * dof,
        }
    }

    /// Persisted form: `(mean, sample std)`
    pub fn to_summary(&self) -> (f64, f64) {
        (self.mean(), self.sample_stddev())
    }

    /// Fold one observation in
    pub fn add(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    /// Number of observations
    pub fn len(&self) -> u64 {
        self.count
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Running mean
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Sum of squared deviations from the mean
    pub fn m2(&self) -> f64 {
        self.m2
    }

    /// Bessel-corrected sample variance
    pub fn sample_variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    /// Bessel-corrected sample standard deviation
    pub fn sample_stddev(&self) -> f64 {
        self.sample_variance().sqrt()
    }

    /// Combine with another accumulator (Chan et al.)
    pub fn merge(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }

        let combined_count = self.count + other.count;
        let delta = other.mean - self.mean;
        let combined_mean = self.mean + delta * (other.count as f64 / combined_count as f64);
        let combined_m2 = self.m2
            + other.m2
            + delta * delta * (self.count as f64 * other.count as f64 / combined_count as f64);

        self.count = combined_count;
        self.mean = combined_mean;
        self.m2 = combined_m2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic() {
        let mut m = RunningMoments::new();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            m.add(v);
        }

        assert_eq!(m.len(), 8);
        assert!((m.mean() - 5.0).abs() < 1e-12);
        // 32 / 7
        assert!((m.sample_variance() - 32.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_value_has_zero_variance() {
        let mut m = RunningMoments::new();
        m.add(42.0);

        assert_eq!(m.mean(), 42.0);
        assert_eq!(m.sample_variance(), 0.0);
        assert_eq!(m.to_summary(), (42.0, 0.0));
    }

    #[test]
    fn test_empty() {
        let m = RunningMoments::new();
        assert!(m.is_empty());
        assert_eq!(m.to_summary(), (0.0, 0.0));
    }

    #[test]
    fn test_from_summary_inverts_to_summary() {
        let mut m = RunningMoments::new();
        for v in [13.0, 170.0, 9.5, 1e6, 42.0] {
            m.add(v);
        }

        let (mean, std) = m.to_summary();
        let rebuilt = RunningMoments::from_summary(m.len(), mean, std);

        assert_eq!(rebuilt.len(), m.len());
        assert_eq!(rebuilt.mean(), m.mean());
        assert!((rebuilt.m2() - m.m2()).abs() <= m.m2() * 1e-12);
    }

    #[test]
    fn test_from_summary_small_counts() {
        let one = RunningMoments::from_summary(1, 100.0, 0.0);
        assert_eq!(one.m2(), 0.0);
        assert_eq!(one.mean(), 100.0);

        let zero = RunningMoments::from_summary(0, 7.0, 0.0);
        assert!(zero.is_empty());
        assert_eq!(zero.mean(), 0.0);
    }

    #[test]
    fn test_add_after_rebuild_matches_direct() {
        let mut direct = RunningMoments::new();
        for v in [100.0, 200.0, 600.0] {
            direct.add(v);
        }

        let mut first_two = RunningMoments::new();
        first_two.add(100.0);
        first_two.add(200.0);
        let (mean, std) = first_two.to_summary();
        let mut rebuilt = RunningMoments::from_summary(2, mean, std);
        rebuilt.add(600.0);

        assert!((rebuilt.mean() - direct.mean()).abs() < 1e-9);
        assert!((rebuilt.sample_stddev() - direct.sample_stddev()).abs() < 1e-9);
    }

    #[test]
    fn test_merge_matches_sequential() {
        let mut a = RunningMoments::new();
        let mut b = RunningMoments::new();
        let mut all = RunningMoments::new();
        for v in [1.0, 2.0, 3.0] {
            a.add(v);
            all.add(v);
        }
        for v in [4.0, 5.0, 6.0] {
            b.add(v);
            all.add(v);
        }

        a.merge(&b);
        assert_eq!(a.len(), 6);
        assert!((a.mean() - 3.5).abs() < 1e-12);
        assert!((a.m2() - all.m2()).abs() < 1e-9);
    }

    #[test]
    fn test_merge_empty() {
        let mut a = RunningMoments::new();
        a.add(1.0);
        a.add(2.0);
        a.merge(&RunningMoments::new());
        assert_eq!(a.len(), 2);

        let mut empty = RunningMoments::new();
        empty.merge(&a);
        assert_eq!(empty, a);
    }

    #[test]
    fn test_numerical_stability() {
        let mut m = RunningMoments::new();
        let base = 1e12;
        for i in 0..1000 {
            m.add(base + i as f64);
        }
        assert!((m.mean() - (base + 499.5)).abs() < 1e-3);
        // variance of 0..999 is 1000*1001/12 with n-1 denominator: 83416.66..
        assert!((m.sample_variance() - 83_416.666_666).abs() < 1.0);
    }
}
