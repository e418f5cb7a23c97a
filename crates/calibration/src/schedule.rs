use std::sync::Arc;
use std::time::{Duration, Instant};

use core_types::{Calibrator, FitSample};
use price_space::PriceSpace;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSettings {
    pub poll_interval: Duration,
    /// Explorations since the last run needed to trigger a new one.
    pub threshold: u64,
    pub fit_timeout: Duration,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            threshold: 100,
            fit_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalibrationReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Refits every level of `space` once.
///
/// Levels are fitted concurrently and independently; a failed, timed out or
/// inconsistent fit keeps that level's previous curve. The space is marked
/// calibrated, at its exploration count from before the fits, only once
/// every level has been joined.
pub async fn calibrate_once(
    space: &PriceSpace,
    calibrator: Arc<dyn Calibrator>,
    fit_timeout: Duration,
) -> CalibrationReport {
    let context = space.context_hash().to_string();
    let explored = space.exploration_count();
    let per_level = space.calibration_samples();

    let mut fits = JoinSet::new();
    for (level, samples) in per_level.into_iter().enumerate() {
        let calibrator = calibrator.clone();
        fits.spawn(async move {
            let started = Instant::now();
            let result = tokio::time::timeout(fit_timeout, calibrator.fit(&samples)).await;
            (level, samples, result, started.elapsed())
        });
    }

    let mut report = CalibrationReport::default();
    while let Some(joined) = fits.join_next().await {
        let (level, samples, result, took) = match joined {
            Ok(done) => done,
            Err(err) => {
                tracing::warn!(context = %context, ?err, "calibration task aborted");
                report.skipped += 1;
                continue;
            }
        };
        metrics::histogram!("optimizer.calibration.fit_ms").record(took.as_secs_f64() * 1_000.0);
        if apply(space, &context, level, &samples, result, calibrator.name()) {
            report.applied += 1;
            metrics::counter!("optimizer.calibration.applied").increment(1);
        } else {
            report.skipped += 1;
            metrics::counter!("optimizer.calibration.skipped").increment(1);
        }
    }
    space.mark_calibrated(explored);
    tracing::info!(
        context = %context,
        applied = report.applied,
        skipped = report.skipped,
        calibrator = calibrator.name(),
        "calibration finished"
    );
    report
}

fn apply(
    space: &PriceSpace,
    context: &str,
    level: usize,
    samples: &[FitSample],
    result: Result<anyhow::Result<Vec<f64>>, tokio::time::error::Elapsed>,
    calibrator: &str,
) -> bool {
    match result {
        Ok(Ok(fitted)) => match space.apply_fit(level, samples, &fitted) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(
                    context,
                    level,
                    calibrator,
                    error = %err,
                    "calibrator broke the fit contract; keeping previous curve"
                );
                false
            }
        },
        Ok(Err(err)) => {
            tracing::warn!(context, level, calibrator, error = ?err, "fit failed");
            false
        }
        Err(_) => {
            tracing::warn!(context, level, calibrator, "fit timed out");
            false
        }
    }
}

/// Polls `space` and recalibrates once enough explorations have accumulated.
/// The task ends when the space is dropped.
pub fn spawn_calibration_loop(
    space: &Arc<PriceSpace>,
    calibrator: Arc<dyn Calibrator>,
    settings: CalibrationSettings,
) -> JoinHandle<()> {
    let space = Arc::downgrade(space);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(space) = space.upgrade() else {
                tracing::debug!("price space dropped; calibration loop exiting");
                break;
            };
            if space.pending_calibration() < settings.threshold {
                continue;
            }
            calibrate_once(&space, calibrator.clone(), settings.fit_timeout).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use core_types::{ExploreRecord, PricingConfig, SpaceDesc};

    use super::*;
    use crate::PoolAdjacentViolators;

    fn space() -> Arc<PriceSpace> {
        let desc = SpaceDesc {
            context_hash: "ctx".to_string(),
            min_price: 0.1,
            max_price: 5.0,
        };
        let cfg = PricingConfig {
            buckets_per_level: 8,
            ..PricingConfig::default()
        };
        Arc::new(PriceSpace::with_seed(&desc, &cfg, 21).expect("space"))
    }

    /// Pushes a falling win rate into every level so the raw estimates are
    /// not monotone.
    fn train(space: &PriceSpace) {
        for (level, partition) in space.levels().iter().enumerate() {
            for bucket in 0..partition.bucket_count() {
                let mut slots = vec![None; space.levels().len()];
                slots[level] = Some(bucket);
                let record = ExploreRecord::new("ctx", slots);
                for k in 0..10 {
                    space.update(&record, k < 10 - bucket);
                }
            }
        }
    }

    struct FailingFitter;

    #[async_trait]
    impl Calibrator for FailingFitter {
        async fn fit(&self, _: &[FitSample]) -> Result<Vec<f64>> {
            bail!("fitter unavailable")
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    struct ShiftingFitter;

    #[async_trait]
    impl Calibrator for ShiftingFitter {
        async fn fit(&self, samples: &[FitSample]) -> Result<Vec<f64>> {
            Ok(vec![0.5; samples.len() + 1])
        }

        fn name(&self) -> &'static str {
            "shifting"
        }
    }

    struct SlowFitter;

    #[async_trait]
    impl Calibrator for SlowFitter {
        async fn fit(&self, samples: &[FitSample]) -> Result<Vec<f64>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![0.5; samples.len()])
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[derive(Default)]
    struct CountingFitter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Calibrator for CountingFitter {
        async fn fit(&self, samples: &[FitSample]) -> Result<Vec<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(vec![0.25; samples.len()])
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tokio::test]
    async fn pav_fit_is_applied_and_monotone() {
        let space = space();
        train(&space);
        let report =
            calibrate_once(&space, Arc::new(PoolAdjacentViolators), Duration::from_secs(1)).await;
        assert_eq!(report, CalibrationReport { applied: 3, skipped: 0 });
        for level in 0..3 {
            let curve = space.curve(level).expect("curve");
            assert!(curve.windows(2).all(|w| w[0] <= w[1]), "{curve:?}");
            assert!(curve.iter().all(|p| (0.0..=1.0).contains(p)));
            assert_ne!(curve, vec![0.5; 8]);
        }
    }

    #[tokio::test]
    async fn failing_fitter_keeps_prior_curve() {
        let space = space();
        train(&space);
        let report = calibrate_once(&space, Arc::new(FailingFitter), Duration::from_secs(1)).await;
        assert_eq!(report, CalibrationReport { applied: 0, skipped: 3 });
        assert_eq!(space.curve(0), Some(vec![0.5; 8]));
    }

    #[tokio::test]
    async fn inconsistent_fit_is_skipped() {
        let space = space();
        let report = calibrate_once(&space, Arc::new(ShiftingFitter), Duration::from_secs(1)).await;
        assert_eq!(report.skipped, 3);
        assert_eq!(space.curve(2), Some(vec![0.5; 8]));
    }

    #[tokio::test]
    async fn slow_fitter_times_out() {
        let space = space();
        let started = Instant::now();
        let report = calibrate_once(&space, Arc::new(SlowFitter), Duration::from_millis(20)).await;
        assert_eq!(report.skipped, 3);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn calibrated_mark_follows_the_fits() {
        let space = space();
        let mut now = Instant::now() + Duration::from_secs(60);
        while space.exploration_count() < 2 {
            now += Duration::from_secs(5);
            let _ = space.explore_at(0.2, 4.9, now);
        }
        let fitter = Arc::new(CountingFitter::default());
        let run = calibrate_once(&space, fitter.clone(), Duration::from_secs(1));
        tokio::pin!(run);

        // fits are sleeping; nothing may be marked yet
        assert!(tokio::time::timeout(Duration::from_millis(10), &mut run).await.is_err());
        assert_eq!(space.last_calibrated(), 0);
        assert_eq!(space.pending_calibration(), 2);

        let report = run.await;
        assert_eq!(report, CalibrationReport { applied: 3, skipped: 0 });
        assert_eq!(space.last_calibrated(), 2);
        assert_eq!(space.pending_calibration(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn loop_waits_for_threshold() {
        let space = space();
        let fitter = Arc::new(CountingFitter::default());
        let settings = CalibrationSettings {
            poll_interval: Duration::from_millis(5),
            threshold: 3,
            fit_timeout: Duration::from_secs(1),
        };
        let handle = spawn_calibration_loop(&space, fitter.clone(), settings);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fitter.calls.load(Ordering::SeqCst), 0);

        let mut now = Instant::now() + Duration::from_secs(60);
        while space.exploration_count() < 3 {
            now += Duration::from_secs(5);
            let _ = space.explore_at(0.2, 4.9, now);
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while space.last_calibrated() == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // the mark is written after all three level fits have been joined
        assert!(space.last_calibrated() >= 3);
        assert!(fitter.calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(space.curve(1), Some(vec![0.25; 8]));
        handle.abort();
    }

    #[tokio::test]
    async fn loop_exits_when_space_dropped() {
        let space = space();
        let handle = spawn_calibration_loop(
            &space,
            Arc::new(PoolAdjacentViolators),
            CalibrationSettings {
                poll_interval: Duration::from_millis(5),
                ..CalibrationSettings::default()
            },
        );
        drop(space);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits")
            .expect("join");
    }
}
