use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_LEVELS: usize = 1;
pub const MIN_BUCKETS: usize = 5;
pub const MIN_BUFFER: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricingConfig {
    pub levels_per_space: usize,
    pub buckets_per_level: usize,
    /// Number of most recent outcomes each bucket keeps in its window.
    pub buffer_size: usize,
    /// EMA weight given to the previous estimate, in [0,1].
    pub discount: f64,
    /// Target selection rate per exploration bin, in selections per second.
    pub desired_exploration_speed: f64,
    /// TTL handed out before any feedback latency has been observed.
    pub default_feedback_ttl_ms: u64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            levels_per_space: 3,
            buckets_per_level: 30,
            buffer_size: 100,
            discount: 0.25,
            desired_exploration_speed: 2.0,
            default_feedback_ttl_ms: 1_000,
        }
    }
}

impl PricingConfig {
    pub fn validate(&self) -> Result<(), PricingError> {
        if self.levels_per_space < MIN_LEVELS {
            return Err(PricingError::InvalidLevelCount(self.levels_per_space));
        }
        if self.buckets_per_level < MIN_BUCKETS {
            return Err(PricingError::InvalidBucketCount(self.buckets_per_level));
        }
        if self.buffer_size < MIN_BUFFER {
            return Err(PricingError::InvalidBufferSize(self.buffer_size));
        }
        if !(0.0..=1.0).contains(&self.discount) {
            return Err(PricingError::InvalidDiscount(self.discount));
        }
        if !self.desired_exploration_speed.is_finite() || self.desired_exploration_speed <= 0.0 {
            return Err(PricingError::InvalidExplorationSpeed(
                self.desired_exploration_speed,
            ));
        }
        Ok(())
    }

    pub fn default_feedback_ttl(&self) -> Duration {
        Duration::from_millis(self.default_feedback_ttl_ms.max(1))
    }

    /// Exploration bins are twice as fine as the bucket partition.
    pub fn exploration_bins(&self) -> usize {
        self.buckets_per_level * 2
    }
}

/// Static description of one pricing context, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpaceDesc {
    pub context_hash: String,
    pub min_price: f64,
    pub max_price: f64,
}

impl SpaceDesc {
    pub fn validate(&self) -> Result<(), PricingError> {
        if !self.min_price.is_finite()
            || !self.max_price.is_finite()
            || self.min_price >= self.max_price
        {
            return Err(PricingError::InvalidPriceRange {
                min: self.min_price,
                max: self.max_price,
            });
        }
        Ok(())
    }
}

/// Buckets touched by one accepted exploration, one slot per level.
///
/// `None` marks a level where the explored price fell outside every bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct ExploreRecord {
    pub context_hash: String,
    pub buckets: Vec<Option<usize>>,
    pub started: Instant,
}

impl ExploreRecord {
    pub fn new(context_hash: impl Into<String>, buckets: Vec<Option<usize>>) -> Self {
        Self::started_at(context_hash, buckets, Instant::now())
    }

    pub fn started_at(
        context_hash: impl Into<String>,
        buckets: Vec<Option<usize>>,
        started: Instant,
    ) -> Self {
        Self {
            context_hash: context_hash.into(),
            buckets,
            started,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// One calibration input point: bucket midpoint and its smoothed win rate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FitSample {
    pub price: f64,
    pub pr: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LevelSnapshot {
    #[serde(rename = "Price")]
    pub price: Vec<f64>,
    #[serde(rename = "Pr")]
    pub pr: Vec<f64>,
}

/// Fitted winning curves of one context, as exposed on `/space`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpaceSnapshot {
    #[serde(rename = "Level")]
    pub levels: Vec<LevelSnapshot>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PricingError {
    #[error("invalid price range [{min:.6}, {max:.6}]")]
    InvalidPriceRange { min: f64, max: f64 },
    #[error("invalid level count {0}")]
    InvalidLevelCount(usize),
    #[error("invalid bucket size {0}")]
    InvalidBucketCount(usize),
    #[error("buffer size error {0}")]
    InvalidBufferSize(usize),
    #[error("discount factor error {0:.6}")]
    InvalidDiscount(f64),
    #[error("invalid exploration speed {0:.6}")]
    InvalidExplorationSpeed(f64),
    #[error("unfeasible price {price:.6} [{min:.6}, {max:.6}]")]
    InfeasiblePrice { price: f64, min: f64, max: f64 },
    #[error("no space")]
    NoSpace,
    #[error("validation error")]
    Validation,
    #[error("inconsistency level {level} bucket {bucket}: price {price:.6} not in [{lhs:.6}, {rhs:.6})")]
    CalibrationMismatch {
        level: usize,
        bucket: usize,
        price: f64,
        lhs: f64,
        rhs: f64,
    },
    #[error("calibration length mismatch: expected {expected}, got {got}")]
    CalibrationLength { expected: usize, got: usize },
    #[error("non-monotonic fit at level {level} index {index}")]
    NonMonotonicFit { level: usize, index: usize },
}

impl PricingError {
    pub fn infeasible(price: f64, min: f64, max: f64) -> Self {
        Self::InfeasiblePrice { price, min, max }
    }

    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            Self::InvalidPriceRange { .. }
                | Self::InvalidLevelCount(_)
                | Self::InvalidBucketCount(_)
                | Self::InvalidBufferSize(_)
                | Self::InvalidDiscount(_)
                | Self::InvalidExplorationSpeed(_)
        )
    }
}

/// Proposes exploration prices inside `(floor_price, price)`.
///
/// `Ok(None)` means the strategy declined and the caller should exploit.
pub trait ExplorationStrategy: Send + Sync {
    fn sample_at(
        &self,
        floor_price: f64,
        price: f64,
        now: Instant,
    ) -> Result<Option<f64>, PricingError>;

    fn sample(&self, floor_price: f64, price: f64) -> Result<Option<f64>, PricingError> {
        self.sample_at(floor_price, price, Instant::now())
    }
}

/// Monotone regression used to turn raw bucket estimates into a winning curve.
///
/// Implementations return one probability per sample, non-decreasing in price.
#[async_trait]
pub trait Calibrator: Send + Sync {
    async fn fit(&self, samples: &[FitSample]) -> Result<Vec<f64>>;

    fn name(&self) -> &'static str;
}
