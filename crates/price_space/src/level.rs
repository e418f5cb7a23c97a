use core_types::PricingError;
use rand::Rng;
use rand_distr::Exp1;

use crate::bucket::Bucket;

pub const LAMBDA_MIN: f64 = 0.1;
pub const LAMBDA_MAX: f64 = 1.8;

const MAX_REDRAWS: usize = 16;

/// Exponential rate per level, evenly spaced over `[LAMBDA_MIN, LAMBDA_MAX]`.
pub fn linspace(levels: usize) -> Vec<f64> {
    let mut lambdas = Vec::with_capacity(levels);
    if levels == 0 {
        return lambdas;
    }
    lambdas.push(LAMBDA_MIN);
    if levels == 1 {
        return lambdas;
    }
    let step = (LAMBDA_MAX - LAMBDA_MIN) / (levels - 1) as f64;
    for i in 1..levels {
        lambdas.push(lambdas[i - 1] + step);
    }
    lambdas
}

/// Draws `buckets + 1` boundaries from `Exp(lambda)`, sorts them and rescales
/// the extremes onto `[min_price, max_price]`.
pub fn generate_bounds<R: Rng>(
    rng: &mut R,
    lambda: f64,
    min_price: f64,
    max_price: f64,
    buckets: usize,
) -> Vec<f64> {
    let span = max_price - min_price;
    for _ in 0..MAX_REDRAWS {
        let mut draws: Vec<f64> = (0..=buckets)
            .map(|_| rng.sample::<f64, _>(Exp1) / lambda)
            .collect();
        draws.sort_by(f64::total_cmp);

        let lo = draws[0];
        let hi = draws[buckets];
        if !(hi > lo) {
            continue;
        }
        let mut bounds: Vec<f64> = draws
            .iter()
            .map(|d| (d - lo) / (hi - lo) * span + min_price)
            .collect();
        bounds[0] = min_price;
        bounds[buckets] = max_price;
        if bounds.windows(2).all(|w| w[0] < w[1]) {
            return bounds;
        }
    }

    tracing::warn!(lambda, buckets, "degenerate exponential draws; using uniform bounds");
    let step = span / buckets as f64;
    let mut bounds: Vec<f64> = (0..=buckets).map(|i| min_price + step * i as f64).collect();
    bounds[buckets] = max_price;
    bounds
}

/// One fixed partition of a price range. Statistics and the fitted curve
/// live in the owning space so they can sit behind separate locks.
#[derive(Debug, Clone, PartialEq)]
pub struct Level {
    lambda: f64,
    bounds: Vec<f64>,
}

impl Level {
    pub fn generate<R: Rng>(
        rng: &mut R,
        lambda: f64,
        min_price: f64,
        max_price: f64,
        buckets: usize,
    ) -> Self {
        Self {
            lambda,
            bounds: generate_bounds(rng, lambda, min_price, max_price, buckets),
        }
    }

    /// Partition with explicit boundaries; they must be strictly increasing.
    pub fn from_bounds(bounds: Vec<f64>) -> Result<Self, PricingError> {
        if bounds.len() < 2 {
            return Err(PricingError::InvalidBucketCount(bounds.len().saturating_sub(1)));
        }
        if let Some(w) = bounds
            .windows(2)
            .find(|w| !(w[0].is_finite() && w[1].is_finite() && w[0] < w[1]))
        {
            return Err(PricingError::InvalidPriceRange {
                min: w[0],
                max: w[1],
            });
        }
        Ok(Self {
            lambda: 0.0,
            bounds,
        })
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    pub fn bucket_count(&self) -> usize {
        self.bounds.len() - 1
    }

    pub fn min_price(&self) -> f64 {
        self.bounds[0]
    }

    pub fn max_price(&self) -> f64 {
        self.bounds[self.bounds.len() - 1]
    }

    pub fn interval(&self, bucket: usize) -> (f64, f64) {
        (self.bounds[bucket], self.bounds[bucket + 1])
    }

    pub fn midpoint(&self, bucket: usize) -> f64 {
        let (lhs, rhs) = self.interval(bucket);
        lhs + (rhs - lhs) / 2.0
    }

    pub fn midpoints(&self) -> Vec<f64> {
        (0..self.bucket_count()).map(|i| self.midpoint(i)).collect()
    }

    pub fn new_buckets(&self, buffer_size: usize, discount: f64) -> Vec<Bucket> {
        self.bounds
            .windows(2)
            .map(|w| Bucket::new(w[0], w[1], buffer_size, discount))
            .collect()
    }

    /// Bucket whose `[lhs, rhs)` holds `price`; the last bucket also takes
    /// `max_price` itself.
    pub fn locate(&self, price: f64) -> Option<usize> {
        let idx = self.bounds.partition_point(|b| *b <= price);
        if idx == 0 {
            return None;
        }
        if idx <= self.bucket_count() {
            return Some(idx - 1);
        }
        (price == self.max_price()).then(|| self.bucket_count() - 1)
    }

    /// Midpoint of the bucket maximising `(price - midpoint) * curve[i]`
    /// between the buckets holding `floor_price` and `price`.
    pub fn exploit(&self, floor_price: f64, price: f64, curve: &[f64]) -> Result<f64, PricingError> {
        let infeasible = || PricingError::infeasible(price, self.min_price(), self.max_price());
        if curve.len() != self.bucket_count() {
            return Err(PricingError::CalibrationLength {
                expected: self.bucket_count(),
                got: curve.len(),
            });
        }
        let (Some(mut left), Some(mut right)) = (self.locate(floor_price), self.locate(price))
        else {
            return Err(infeasible());
        };

        // never recommend a bucket whose midpoint falls outside the request
        if floor_price > self.midpoint(left) {
            left += 1;
        }
        if price < self.midpoint(right) {
            right = right.checked_sub(1).ok_or_else(infeasible)?;
        }
        if left > right || right >= self.bucket_count() {
            return Err(infeasible());
        }

        let mut best: Option<(f64, f64)> = None;
        for (i, pr) in curve.iter().enumerate().take(right + 1).skip(left) {
            let mid = self.midpoint(i);
            let margin = (price - mid) * pr;
            if best.map_or(true, |(top, _)| margin > top) {
                best = Some((margin, mid));
            }
        }
        best.map(|(_, mid)| mid).ok_or_else(infeasible)
    }
}
