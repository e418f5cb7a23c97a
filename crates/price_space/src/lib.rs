//! Per-context pricing model.
//!
//! A [`PriceSpace`] holds several [`Level`]s, each an independent partition of
//! the same price range. Raw bucket statistics and fitted winning curves sit
//! behind separate locks: request-time updates touch only the statistics,
//! exploit reads only the curves, and calibration reads the former and writes
//! the latter without ever holding both.

mod bucket;
mod combiner;
mod level;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use core_types::{
    ExplorationStrategy, ExploreRecord, FitSample, LevelSnapshot, PricingConfig, PricingError,
    SpaceDesc, SpaceSnapshot,
};
use exploration_sampler::AdaptiveRateSampler;
use parking_lot::{Mutex, RwLock};
use pending_settlement::AdaptiveTimeoutEstimator;
use rand::rngs::StdRng;
use rand::SeedableRng;

pub use bucket::Bucket;
pub use combiner::{LevelCombiner, MeanCombiner, MedianCombiner};
pub use level::{generate_bounds, linspace, Level, LAMBDA_MAX, LAMBDA_MIN};

const INITIAL_WIN_RATE: f64 = 0.5;
const MONOTONE_TOLERANCE: f64 = 1e-9;

/// Accepted exploration: the price to serve, the buckets it will settle and
/// how long to wait for feedback.
#[derive(Debug, Clone, PartialEq)]
pub struct Exploration {
    pub price: f64,
    pub record: ExploreRecord,
    pub ttl: Duration,
}

pub struct PriceSpace {
    context_hash: String,
    min_price: f64,
    max_price: f64,
    levels: Vec<Level>,
    stats: Mutex<Vec<Vec<Bucket>>>,
    curves: RwLock<Vec<Vec<f64>>>,
    sampler: Box<dyn ExplorationStrategy>,
    combiner: Box<dyn LevelCombiner>,
    timeout: AdaptiveTimeoutEstimator,
    // scheduling hints for calibration only
    exploration_count: AtomicU64,
    last_calibrated: AtomicU64,
}

impl std::fmt::Debug for PriceSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceSpace")
            .field("context_hash", &self.context_hash)
            .field("min_price", &self.min_price)
            .field("max_price", &self.max_price)
            .field("levels", &self.levels.len())
            .field("combiner", &self.combiner.name())
            .field("exploration_count", &self.exploration_count())
            .finish()
    }
}

impl PriceSpace {
    pub fn new(desc: &SpaceDesc, cfg: &PricingConfig) -> Result<Self, PricingError> {
        let sampler = AdaptiveRateSampler::new(
            desc.context_hash.clone(),
            desc.min_price,
            desc.max_price,
            cfg.exploration_bins(),
            cfg.desired_exploration_speed,
        );
        Self::build(desc, cfg, StdRng::from_os_rng(), Box::new(sampler))
    }

    /// Reproducible partitions and exploration draws.
    pub fn with_seed(desc: &SpaceDesc, cfg: &PricingConfig, seed: u64) -> Result<Self, PricingError> {
        let sampler = AdaptiveRateSampler::with_seed(
            desc.context_hash.clone(),
            desc.min_price,
            desc.max_price,
            cfg.exploration_bins(),
            cfg.desired_exploration_speed,
            seed.wrapping_add(1),
        );
        Self::build(desc, cfg, StdRng::seed_from_u64(seed), Box::new(sampler))
    }

    fn build(
        desc: &SpaceDesc,
        cfg: &PricingConfig,
        mut rng: StdRng,
        sampler: Box<dyn ExplorationStrategy>,
    ) -> Result<Self, PricingError> {
        desc.validate()?;
        cfg.validate()?;

        let levels: Vec<Level> = linspace(cfg.levels_per_space)
            .into_iter()
            .map(|lambda| {
                Level::generate(
                    &mut rng,
                    lambda,
                    desc.min_price,
                    desc.max_price,
                    cfg.buckets_per_level,
                )
            })
            .collect();
        Self::from_levels(desc, cfg, levels, sampler)
    }

    /// Space over explicit partitions. Needs at least one level, and every
    /// level must span exactly `[desc.min_price, desc.max_price]`.
    pub fn from_levels(
        desc: &SpaceDesc,
        cfg: &PricingConfig,
        levels: Vec<Level>,
        sampler: Box<dyn ExplorationStrategy>,
    ) -> Result<Self, PricingError> {
        desc.validate()?;
        cfg.validate()?;
        if levels.is_empty() {
            return Err(PricingError::InvalidLevelCount(0));
        }
        if let Some(level) = levels
            .iter()
            .find(|l| l.min_price() != desc.min_price || l.max_price() != desc.max_price)
        {
            return Err(PricingError::InvalidPriceRange {
                min: level.min_price(),
                max: level.max_price(),
            });
        }

        let stats = levels
            .iter()
            .map(|l| l.new_buckets(cfg.buffer_size, cfg.discount))
            .collect();
        let curves = levels
            .iter()
            .map(|l| vec![INITIAL_WIN_RATE; l.bucket_count()])
            .collect();
        tracing::debug!(
            context = %desc.context_hash,
            levels = levels.len(),
            buckets = cfg.buckets_per_level,
            "price space built"
        );
        Ok(Self {
            context_hash: desc.context_hash.clone(),
            min_price: desc.min_price,
            max_price: desc.max_price,
            levels,
            stats: Mutex::new(stats),
            curves: RwLock::new(curves),
            sampler,
            combiner: Box::new(MeanCombiner),
            timeout: AdaptiveTimeoutEstimator::new(cfg.default_feedback_ttl()),
            exploration_count: AtomicU64::new(0),
            last_calibrated: AtomicU64::new(0),
        })
    }

    pub fn with_strategy(mut self, sampler: Box<dyn ExplorationStrategy>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_combiner(mut self, combiner: Box<dyn LevelCombiner>) -> Self {
        self.combiner = combiner;
        self
    }

    pub fn context_hash(&self) -> &str {
        &self.context_hash
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.min_price, self.max_price)
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn combiner_name(&self) -> &'static str {
        self.combiner.name()
    }

    pub fn feedback_ttl(&self) -> Duration {
        self.timeout.time()
    }

    pub fn explore(&self, floor_price: f64, price: f64) -> Result<Option<Exploration>, PricingError> {
        self.explore_at(floor_price, price, Instant::now())
    }

    /// `Ok(None)` when the sampler declines; nothing is recorded then.
    pub fn explore_at(
        &self,
        floor_price: f64,
        price: f64,
        now: Instant,
    ) -> Result<Option<Exploration>, PricingError> {
        let Some(chosen) = self.sampler.sample_at(floor_price, price, now)? else {
            return Ok(None);
        };
        self.exploration_count.fetch_add(1, Ordering::Relaxed);

        let buckets = self.levels.iter().map(|l| l.locate(chosen)).collect();
        Ok(Some(Exploration {
            price: chosen,
            record: ExploreRecord::started_at(self.context_hash.clone(), buckets, now),
            ttl: self.timeout.time(),
        }))
    }

    pub fn update(&self, record: &ExploreRecord, impression: bool) {
        self.update_at(record, impression, Instant::now());
    }

    /// Only confirmed impressions feed the feedback-latency model; a missing
    /// outcome has no meaningful latency.
    pub fn update_at(&self, record: &ExploreRecord, impression: bool, now: Instant) {
        tracing::debug!(context = %record.context_hash, impression, "update");
        {
            let mut stats = self.stats.lock();
            for (buckets, slot) in stats.iter_mut().zip(&record.buckets) {
                if let Some(bucket) = slot.and_then(|i| buckets.get_mut(i)) {
                    bucket.update(impression);
                }
            }
        }
        if impression {
            self.timeout.record(now.saturating_duration_since(record.started));
        }
    }

    pub fn exploit(&self, floor_price: f64, price: f64) -> Result<f64, PricingError> {
        if !(floor_price <= price) {
            return Err(PricingError::infeasible(price, self.min_price, self.max_price));
        }

        let curves = self.curves.read();
        let mut first_err = None;
        let mut picks = Vec::with_capacity(self.levels.len());
        for (level, curve) in self.levels.iter().zip(curves.iter()) {
            match level.exploit(floor_price, price, curve) {
                Ok(p) => picks.push(p),
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        drop(curves);

        self.combiner.combine(&picks).ok_or_else(|| {
            first_err
                .unwrap_or_else(|| PricingError::infeasible(price, self.min_price, self.max_price))
        })
    }

    /// Bucket midpoints with their fitted win probabilities, per level.
    pub fn snapshot(&self) -> SpaceSnapshot {
        let curves = self.curves.read();
        SpaceSnapshot {
            levels: self
                .levels
                .iter()
                .zip(curves.iter())
                .map(|(level, curve)| LevelSnapshot {
                    price: level.midpoints(),
                    pr: curve.clone(),
                })
                .collect(),
        }
    }

    /// Raw statistics of one level, cloned under the statistics lock.
    pub fn buckets(&self, level: usize) -> Option<Vec<Bucket>> {
        self.stats.lock().get(level).cloned()
    }

    pub fn curve(&self, level: usize) -> Option<Vec<f64>> {
        self.curves.read().get(level).cloned()
    }

    /// `(midpoint, pr)` for every bucket, taken under the statistics lock.
    pub fn calibration_samples(&self) -> Vec<Vec<FitSample>> {
        let stats = self.stats.lock();
        stats
            .iter()
            .map(|buckets| {
                buckets
                    .iter()
                    .map(|b| FitSample {
                        price: b.midpoint(),
                        pr: b.pr,
                    })
                    .collect()
            })
            .collect()
    }

    /// Installs a fitted curve for one level. On any inconsistency the prior
    /// curve is kept and the error returned.
    pub fn apply_fit(
        &self,
        level: usize,
        samples: &[FitSample],
        fitted: &[f64],
    ) -> Result<(), PricingError> {
        let partition = self.levels.get(level).ok_or(PricingError::CalibrationLength {
            expected: self.levels.len(),
            got: level,
        })?;
        let expected = partition.bucket_count();
        for got in [samples.len(), fitted.len()] {
            if got != expected {
                return Err(PricingError::CalibrationLength { expected, got });
            }
        }

        for (bucket, sample) in samples.iter().enumerate() {
            let (lhs, rhs) = partition.interval(bucket);
            if !(sample.price >= lhs && sample.price < rhs) {
                return Err(PricingError::CalibrationMismatch {
                    level,
                    bucket,
                    price: sample.price,
                    lhs,
                    rhs,
                });
            }
        }
        if let Some(index) = fitted.iter().position(|v| !v.is_finite()) {
            return Err(PricingError::NonMonotonicFit { level, index });
        }
        if let Some(index) = fitted
            .windows(2)
            .position(|w| w[1] < w[0] - MONOTONE_TOLERANCE)
        {
            return Err(PricingError::NonMonotonicFit {
                level,
                index: index + 1,
            });
        }

        let curve: Vec<f64> = fitted.iter().map(|v| v.clamp(0.0, 1.0)).collect();
        self.curves.write()[level] = curve;
        Ok(())
    }

    pub fn exploration_count(&self) -> u64 {
        self.exploration_count.load(Ordering::Relaxed)
    }

    pub fn last_calibrated(&self) -> u64 {
        self.last_calibrated.load(Ordering::Relaxed)
    }

    /// Explorations recorded since the last calibration.
    pub fn pending_calibration(&self) -> u64 {
        self.exploration_count()
            .saturating_sub(self.last_calibrated())
    }

    pub fn mark_calibrated(&self, at: u64) {
        self.last_calibrated.store(at, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(min: f64, max: f64) -> SpaceDesc {
        SpaceDesc {
            context_hash: "ctx".to_string(),
            min_price: min,
            max_price: max,
        }
    }

    fn unit_space() -> PriceSpace {
        let cfg = PricingConfig {
            levels_per_space: 1,
            buckets_per_level: 10,
            ..PricingConfig::default()
        };
        let d = desc(1.0, 11.0);
        let level = Level::from_bounds((1..=11).map(f64::from).collect()).expect("bounds");
        let sampler = AdaptiveRateSampler::with_seed("ctx", 1.0, 11.0, 20, 2.0, 5);
        PriceSpace::from_levels(&d, &cfg, vec![level], Box::new(sampler)).expect("space")
    }

    #[test]
    fn explicit_levels_must_cover_the_range() {
        let cfg = PricingConfig {
            levels_per_space: 1,
            buckets_per_level: 10,
            ..PricingConfig::default()
        };
        let d = desc(1.0, 11.0);
        let sampler = || Box::new(AdaptiveRateSampler::with_seed("ctx", 1.0, 11.0, 20, 2.0, 5));

        let err = PriceSpace::from_levels(&d, &cfg, Vec::new(), sampler()).expect_err("no levels");
        assert_eq!(err, PricingError::InvalidLevelCount(0));

        let short = Level::from_bounds((1..=10).map(f64::from).collect()).expect("bounds");
        let err = PriceSpace::from_levels(&d, &cfg, vec![short], sampler()).expect_err("short");
        assert_eq!(err, PricingError::InvalidPriceRange { min: 1.0, max: 10.0 });

        let full = Level::from_bounds((1..=11).map(f64::from).collect()).expect("bounds");
        assert!(PriceSpace::from_levels(&desc(11.0, 1.0), &cfg, vec![full], sampler()).is_err());
    }

    #[test]
    fn construction_validates_inputs() {
        let cfg = PricingConfig::default();
        let err = PriceSpace::new(&desc(2.0, 1.0), &cfg).expect_err("inverted");
        assert!(err.is_construction());

        let bad = PricingConfig {
            buckets_per_level: 3,
            ..PricingConfig::default()
        };
        assert_eq!(
            PriceSpace::new(&desc(0.1, 1.0), &bad).map(|_| ()),
            Err(PricingError::InvalidBucketCount(3))
        );
    }

    #[test]
    fn levels_share_range_and_bucket_count() {
        let cfg = PricingConfig::default();
        let space = PriceSpace::with_seed(&desc(0.0041, 0.3015), &cfg, 9).expect("space");
        assert_eq!(space.levels().len(), 3);
        for level in space.levels() {
            assert_eq!(level.bucket_count(), 30);
            assert_eq!(level.min_price(), 0.0041);
            assert_eq!(level.max_price(), 0.3015);
            assert!(level.bounds().windows(2).all(|w| w[0] < w[1]));
        }
        assert_ne!(space.levels()[0].bounds(), space.levels()[2].bounds());
    }

    #[test]
    fn repeated_explores_mostly_accept_inside_bounds() {
        let cfg = PricingConfig {
            levels_per_space: 3,
            buckets_per_level: 30,
            desired_exploration_speed: 2.0,
            ..PricingConfig::default()
        };
        let space = PriceSpace::with_seed(&desc(0.2, 10.0), &cfg, 17).expect("space");
        let (floor, price) = (0.3, 9.5);
        let base = Instant::now();
        let (mut errors, mut declines, mut accepted) = (0, 0, 0);
        let calls = 500u64;
        for i in 1..=calls {
            let now = base + Duration::from_millis(100 * i);
            match space.explore_at(floor, price, now) {
                Err(_) => errors += 1,
                Ok(None) => declines += 1,
                Ok(Some(e)) => {
                    assert!(e.price > floor && e.price < price, "{}", e.price);
                    assert_eq!(e.record.buckets.len(), 3);
                    assert!(e.record.buckets.iter().all(Option::is_some));
                    accepted += 1;
                }
            }
        }
        assert!(errors * 100 < calls * 15, "errors {errors}");
        assert!(declines * 100 < calls * 15, "declines {declines}");
        assert_eq!(space.exploration_count(), accepted);
    }

    #[test]
    fn infeasible_explore_leaves_counter_untouched() {
        let space = PriceSpace::with_seed(&desc(0.0041, 0.3015), &PricingConfig::default(), 1)
            .expect("space");
        let err = space.explore(0.2, 1.2).expect_err("above range");
        assert_eq!(err.to_string(), "unfeasible price 1.200000 [0.004100, 0.301500]");
        assert_eq!(space.exploration_count(), 0);
    }

    #[test]
    fn update_touches_recorded_buckets_only() {
        let space = unit_space();
        let t0 = Instant::now();
        let record = ExploreRecord::started_at("ctx", vec![Some(3)], t0);
        space.update_at(&record, true, t0 + Duration::from_millis(40));

        let buckets = space.buckets(0).expect("level");
        assert_eq!(buckets[3].update_qty, 1);
        assert_eq!(buckets[3].alpha, 2.0);
        assert!(buckets.iter().enumerate().all(|(i, b)| i == 3 || b.update_qty == 0));
        assert_eq!(space.feedback_ttl(), Duration::from_millis(80));
    }

    #[test]
    fn missed_impression_does_not_feed_latency() {
        let space = unit_space();
        let t0 = Instant::now();
        let record = ExploreRecord::started_at("ctx", vec![None], t0);
        space.update_at(&record, false, t0 + Duration::from_millis(40));
        assert_eq!(space.feedback_ttl(), Duration::from_secs(1));
        assert!(space.buckets(0).expect("level").iter().all(|b| b.update_qty == 0));
    }

    #[test]
    fn exploit_uses_fitted_curve() {
        let space = unit_space();
        let samples = space.calibration_samples().remove(0);
        let rising: Vec<f64> = (0..10).map(|i| 0.05 + 0.1 * f64::from(i)).collect();
        space.apply_fit(0, &samples, &rising).expect("apply");
        let got = space.exploit(1.2, 9.8).expect("exploit");
        assert!((got - 5.5).abs() < 1e-12, "{got}");
    }

    #[test]
    fn exploit_rejects_inverted_request() {
        let space = unit_space();
        assert!(space.exploit(5.0, 4.0).is_err());
        assert_eq!(
            space.exploit(1.2, 12.0),
            Err(PricingError::infeasible(12.0, 1.0, 11.0))
        );
    }

    #[test]
    fn mismatching_fit_keeps_prior_curve() {
        let space = unit_space();
        let mut samples = space.calibration_samples().remove(0);
        samples[4].price = 9.9;
        let err = space.apply_fit(0, &samples, &[0.7; 10]).expect_err("mismatch");
        assert!(matches!(
            err,
            PricingError::CalibrationMismatch { level: 0, bucket: 4, .. }
        ));
        assert_eq!(space.curve(0), Some(vec![0.5; 10]));

        let samples = space.calibration_samples().remove(0);
        let falling: Vec<f64> = (0..10).map(|i| 1.0 - 0.1 * f64::from(i)).collect();
        assert!(matches!(
            space.apply_fit(0, &samples, &falling),
            Err(PricingError::NonMonotonicFit { level: 0, index: 1 })
        ));
        assert!(matches!(
            space.apply_fit(0, &samples[..3], &[0.5; 3]),
            Err(PricingError::CalibrationLength { expected: 10, got: 3 })
        ));
        assert_eq!(space.curve(0), Some(vec![0.5; 10]));
    }

    #[test]
    fn snapshot_reports_midpoints_and_curve() {
        let space = unit_space();
        let snap = space.snapshot();
        assert_eq!(snap.levels.len(), 1);
        assert_eq!(snap.levels[0].price[0], 1.5);
        assert_eq!(snap.levels[0].pr, vec![0.5; 10]);
    }

    #[test]
    fn combiner_is_pluggable() {
        let space = unit_space().with_combiner(Box::new(MedianCombiner));
        assert_eq!(space.combiner_name(), "median");
    }

    #[test]
    fn calibration_counters() {
        let space = unit_space();
        let base = Instant::now() + Duration::from_secs(30);
        for i in 0..5u64 {
            let _ = space.explore_at(1.1, 10.9, base + Duration::from_secs(i));
        }
        let seen = space.exploration_count();
        assert_eq!(space.pending_calibration(), seen);
        space.mark_calibrated(seen);
        assert_eq!(space.pending_calibration(), 0);
        assert_eq!(space.last_calibrated(), seen);
    }
}
