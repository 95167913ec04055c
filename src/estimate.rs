//! Network size estimation.
//!
//! Contacts are spread uniformly over the identifier space, so the distance from a target to its
//! i-th closest contact grows linearly with i. Fitting that line by least squares gives the mean
//! spacing between nodes, and dividing the space by it gives the network size.

use std::collections::HashMap;

use time::{Duration, OffsetDateTime};
use tracing::{debug, trace};

use crate::core::kuid::Kuid;

/// Estimates the network size from the identifiers closest to `target`, closest first. Returns
/// `None` for an empty sample.
pub fn estimate_size(target: &Kuid, closest: &[Kuid]) -> Option<Kuid> {
    if closest.is_empty() {
        return None;
    }

    // Least squares through the origin: sparseness = Σ(dᵢ·i) / Σ(i²).
    let mut weighted = Kuid::ZERO;
    let mut ranks = closest.len() as u64;
    for (i, id) in closest.iter().enumerate() {
        let rank = i as u64 + 1;

        let (term, overflow) = target.distance(id).overflowing_mul(&Kuid::from_u64(rank));
        let (sum, carry) = weighted.overflowing_add(&term);
        if overflow || carry {
            // Networks smaller than the sample overflow the sum.
            trace!(rank, "distance sum saturated");
            weighted = Kuid::MAX;
            ranks = rank;
            break;
        }
        weighted = sum;
    }

    let (sparseness, _) = weighted.div_rem(&Kuid::from_u64(sum_of_squares(ranks)))?;
    let sparseness = if sparseness.is_zero() {
        Kuid::from_u64(1)
    } else {
        sparseness
    };

    let (size, _) = Kuid::MAX.div_rem(&sparseness)?;
    let (size, carry) = size.overflowing_add(&Kuid::from_u64(1));

    Some(if carry { Kuid::MAX } else { size })
}

// Σ(i²) for i = 1..=n, saturating at `u64::MAX`.
fn sum_of_squares(n: u64) -> u64 {
    let n = n as u128;
    n.checked_mul(n + 1)
        .and_then(|product| product.checked_mul(2 * n + 1))
        .and_then(|product| u64::try_from(product / 6).ok())
        .unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    size: Kuid,
    taken: OffsetDateTime,
}

/// Keeps the latest estimate per subspace, keyed by the target's leading byte, plus one taken
/// around the local identifier, and publishes their average.
#[derive(Debug, Clone)]
pub struct SizeEstimator {
    lifetime: Duration,
    subspaces: HashMap<u8, Sample>,
    local: Option<Sample>,
    average: Kuid,
}

impl SizeEstimator {
    /// Creates an estimator discarding samples older than `lifetime`.
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            subspaces: HashMap::new(),
            local: None,
            average: Kuid::ZERO,
        }
    }

    /// Records the result of a lookup for `target`. The sample supersedes the previous one for
    /// the same subspace.
    pub fn record(&mut self, target: &Kuid, closest: &[Kuid], now: OffsetDateTime) -> Option<Kuid> {
        let size = estimate_size(target, closest)?;
        self.subspaces
            .insert(target.leading_byte(), Sample { size, taken: now });
        self.recompute(now);

        Some(size)
    }

    /// Records a sample taken from our own buckets around the local identifier.
    pub fn record_local(
        &mut self,
        local_id: &Kuid,
        closest: &[Kuid],
        now: OffsetDateTime,
    ) -> Option<Kuid> {
        let size = estimate_size(local_id, closest)?;
        self.local = Some(Sample { size, taken: now });
        self.recompute(now);

        Some(size)
    }

    /// The published estimate, zero until a sample is taken.
    pub fn estimate(&self) -> Kuid {
        self.average
    }

    /// The number of samples backing the estimate.
    pub fn samples(&self) -> usize {
        self.subspaces.len() + usize::from(self.local.is_some())
    }

    fn recompute(&mut self, now: OffsetDateTime) {
        let lifetime = self.lifetime;
        self.subspaces.retain(|_, sample| now - sample.taken <= lifetime);
        if matches!(self.local, Some(sample) if now - sample.taken > lifetime) {
            self.local = None;
        }

        let sizes: Vec<Kuid> = self
            .subspaces
            .values()
            .chain(self.local.iter())
            .map(|sample| sample.size)
            .collect();
        if sizes.is_empty() {
            return;
        }

        // Drop outliers further than one standard deviation from the mean.
        let values: Vec<f64> = sizes.iter().map(Kuid::to_f64).collect();
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let std_dev = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();

        let mut kept: Vec<Kuid> = sizes
            .iter()
            .zip(&values)
            .filter(|(_, v)| (*v - mean).abs() <= std_dev)
            .map(|(size, _)| *size)
            .collect();
        if kept.is_empty() {
            kept = sizes.clone();
        }

        let mut sum = Kuid::ZERO;
        let mut saturated = false;
        for size in &kept {
            let (total, carry) = sum.overflowing_add(size);
            if carry {
                saturated = true;
                break;
            }
            sum = total;
        }

        self.average = if saturated {
            Kuid::MAX
        } else {
            sum.div_rem(&Kuid::from_u64(kept.len() as u64))
                .map_or(sum, |(quotient, _)| quotient)
        };

        debug!(
            samples = sizes.len(),
            kept = kept.len(),
            estimate = self.average.to_u64_saturating(),
            "updated network size estimate"
        );
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    // Identifiers at exactly `2^(159 - bit)` apart from the target.
    fn spaced(target: &Kuid, bit: usize, count: u64) -> Vec<Kuid> {
        let spacing = Kuid::ZERO.with_bit(bit);
        (1..=count)
            .map(|i| target.distance(&Kuid::from_u64(i).overflowing_mul(&spacing).0))
            .collect()
    }

    #[test]
    fn squares_saturate() {
        assert_eq!(sum_of_squares(1), 1);
        assert_eq!(sum_of_squares(20), 2_870);
        assert_eq!(sum_of_squares(3_000_000), 9_000_004_500_000_500_000);
        assert_eq!(sum_of_squares(4_000_000), u64::MAX);
        assert_eq!(sum_of_squares(u64::MAX), u64::MAX);
    }

    #[test]
    fn empty_sample() {
        assert!(estimate_size(&Kuid::ZERO, &[]).is_none());
    }

    #[test]
    fn regular_spacing() {
        let target = Kuid::rand();

        assert_eq!(
            estimate_size(&target, &spaced(&target, 11, 20)),
            Some(Kuid::from_u64(4096))
        );
        assert_eq!(
            estimate_size(&target, &spaced(&target, 19, 100)),
            Some(Kuid::from_u64(1 << 20))
        );
    }

    #[test]
    fn saturated_sum() {
        // The second term overflows: the sum is pinned and the estimate ends up tiny.
        let closest = [Kuid::ZERO.with_bit(0), Kuid::ZERO.with_bit(0).with_bit(159)];

        assert_eq!(
            estimate_size(&Kuid::ZERO, &closest),
            Some(Kuid::from_u64(6))
        );
    }

    #[test]
    fn uniform_network() {
        let mut rng = StdRng::seed_from_u64(7);

        for size in [1_000u64, 10_000, 100_000] {
            let mut ids: Vec<Kuid> = (0..size).map(|_| Kuid::random_with(&mut rng)).collect();
            let target = Kuid::random_with(&mut rng);
            ids.sort_by(|a, b| target.cmp_distance(a, b));
            ids.truncate(100);

            let estimate = estimate_size(&target, &ids).unwrap().to_u64_saturating();
            assert!(
                estimate > size / 3 && estimate < size * 3,
                "estimated {estimate} for {size} nodes"
            );
        }
    }

    #[test]
    fn small_network_stays_small() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut ids: Vec<Kuid> = (0..30).map(|_| Kuid::random_with(&mut rng)).collect();
        let target = Kuid::random_with(&mut rng);
        ids.sort_by(|a, b| target.cmp_distance(a, b));

        let estimate = estimate_size(&target, &ids).unwrap().to_u64_saturating();
        assert!(estimate > 1 && estimate < 10_000);
    }

    #[test]
    fn average_drops_outliers() {
        let now = OffsetDateTime::now_utc();
        let mut estimator = SizeEstimator::new(Duration::hours(1));

        for leading in 0..5u8 {
            let target = Kuid::ZERO.with_bit(0).with_bit(leading as usize + 1);
            estimator.record(&target, &spaced(&target, 11, 20), now);
        }
        let outlier = Kuid::ZERO.with_bit(7);
        estimator.record(&outlier, &spaced(&outlier, 29, 20), now);

        assert_eq!(estimator.samples(), 6);
        assert_eq!(estimator.estimate(), Kuid::from_u64(4096));
    }

    #[test]
    fn subspace_sample_is_replaced() {
        let now = OffsetDateTime::now_utc();
        let mut estimator = SizeEstimator::new(Duration::hours(1));
        let target = Kuid::ZERO.with_bit(3);

        estimator.record(&target, &spaced(&target, 11, 20), now);
        estimator.record(&target, &spaced(&target, 13, 20), now);

        assert_eq!(estimator.samples(), 1);
        assert_eq!(estimator.estimate(), Kuid::from_u64(16384));
    }

    #[test]
    fn samples_expire() {
        let now = OffsetDateTime::now_utc();
        let mut estimator = SizeEstimator::new(Duration::hours(1));

        let first = Kuid::ZERO.with_bit(0);
        estimator.record(&first, &spaced(&first, 11, 20), now);
        estimator.record_local(&Kuid::ZERO, &spaced(&Kuid::ZERO, 11, 20), now);
        assert_eq!(estimator.samples(), 2);

        let second = Kuid::ZERO.with_bit(1);
        estimator.record(&second, &spaced(&second, 19, 20), now + Duration::hours(2));

        assert_eq!(estimator.samples(), 1);
        assert_eq!(estimator.estimate(), Kuid::from_u64(1 << 20));
    }
}
