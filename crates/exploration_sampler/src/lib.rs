//! Adaptive-rate exploration price sampler.
//!
//! The feasible range is cut into equal-width bins. Each bin remembers when it
//! was last explored; a candidate bin's estimated exploration speed is the
//! inverse of the time since then. Candidates are visited from the most starved
//! to the least and accepted with probability `min(1, desired / estimated)`, so
//! every bin's long-run selection rate converges toward the desired speed.

use std::time::Instant;

use core_types::{ExplorationStrategy, PricingError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug)]
struct SamplerState {
    last_chosen: Vec<Instant>,
    rng: StdRng,
}

#[derive(Debug)]
pub struct AdaptiveRateSampler {
    context_hash: String,
    edges: Vec<f64>,
    desired_speed: f64,
    state: Mutex<SamplerState>,
}

impl AdaptiveRateSampler {
    pub fn new(
        context_hash: impl Into<String>,
        min_price: f64,
        max_price: f64,
        bins: usize,
        desired_speed: f64,
    ) -> Self {
        Self::build(
            context_hash.into(),
            min_price,
            max_price,
            bins,
            desired_speed,
            StdRng::from_os_rng(),
            Instant::now(),
        )
    }

    /// Deterministic sampler for tests and replays.
    pub fn with_seed(
        context_hash: impl Into<String>,
        min_price: f64,
        max_price: f64,
        bins: usize,
        desired_speed: f64,
        seed: u64,
    ) -> Self {
        Self::build(
            context_hash.into(),
            min_price,
            max_price,
            bins,
            desired_speed,
            StdRng::seed_from_u64(seed),
            Instant::now(),
        )
    }

    fn build(
        context_hash: String,
        min_price: f64,
        max_price: f64,
        bins: usize,
        desired_speed: f64,
        rng: StdRng,
        now: Instant,
    ) -> Self {
        let bins = bins.max(1);
        let step = (max_price - min_price) / bins as f64;
        let mut edges = Vec::with_capacity(bins + 1);
        edges.push(min_price);
        for i in 1..bins {
            edges.push(edges[i - 1] + step);
        }
        edges.push(max_price);

        Self {
            context_hash,
            edges,
            desired_speed,
            state: Mutex::new(SamplerState {
                last_chosen: vec![now; bins],
                rng,
            }),
        }
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn bins(&self) -> usize {
        self.edges.len() - 1
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.edges[0], self.edges[self.edges.len() - 1])
    }

    /// Index of the bin whose interval `(e_i, e_{i+1}]` holds `price`.
    pub fn find_leftmost(&self, price: f64) -> Result<usize, PricingError> {
        let (min, max) = self.bounds();
        if !(price > min && price <= max) {
            tracing::debug!(
                context = %self.context_hash,
                price,
                min,
                max,
                "unfeasible exploration price"
            );
            return Err(PricingError::infeasible(price, min, max));
        }
        Ok(self.edges.partition_point(|edge| *edge < price) - 1)
    }

    fn select_bin(
        &self,
        state: &mut SamplerState,
        l: usize,
        r: usize,
        now: Instant,
    ) -> Option<usize> {
        let mut candidates: Vec<(usize, f64)> = (l + 1..r)
            .map(|bin| {
                let elapsed = now
                    .saturating_duration_since(state.last_chosen[bin])
                    .as_secs_f64();
                (bin, estimated_speed(elapsed))
            })
            .collect();
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1));

        for (bin, speed) in candidates {
            let accept = (self.desired_speed / speed).min(1.0);
            if state.rng.random::<f64>() < accept {
                state.last_chosen[bin] = now;
                return Some(bin);
            }
        }
        None
    }
}

impl ExplorationStrategy for AdaptiveRateSampler {
    fn sample_at(
        &self,
        floor_price: f64,
        price: f64,
        now: Instant,
    ) -> Result<Option<f64>, PricingError> {
        let r = self.find_leftmost(price)?;
        let l = self.find_leftmost(floor_price)?;
        if r < l + 2 {
            return Ok(None);
        }

        let mut state = self.state.lock();
        let Some(bin) = self.select_bin(&mut state, l, r, now) else {
            return Ok(None);
        };
        let lo = self.edges[bin];
        let hi = self.edges[bin + 1];
        Ok(Some(lo + (hi - lo) * state.rng.random::<f64>()))
    }
}

#[inline]
fn estimated_speed(elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        f64::INFINITY
    } else {
        1.0 / elapsed_secs
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn sampler(min: f64, max: f64, bins: usize, speed: f64) -> AdaptiveRateSampler {
        AdaptiveRateSampler::with_seed("ctx", min, max, bins, speed, 7)
    }

    #[test]
    fn edges_split_range_evenly() {
        let s = sampler(0.1, 0.5, 4, 5.0);
        let want = [0.1, 0.2, 0.3, 0.4, 0.5];
        assert_eq!(s.edges().len(), want.len());
        for (got, want) in s.edges().iter().zip(want) {
            assert!((got - want).abs() < 1e-12, "{got} vs {want}");
        }
    }

    #[test]
    fn find_leftmost_locates_bin_or_rejects() {
        let s = sampler(0.1, 0.5, 4, 0.25);
        assert_eq!(s.find_leftmost(0.22), Ok(1));
        assert_eq!(s.find_leftmost(0.5), Ok(3));
        assert!(s.find_leftmost(0.55).is_err());
        assert!(s.find_leftmost(0.05).is_err());
        assert!(s.find_leftmost(0.1).is_err());
        assert!(s.find_leftmost(f64::NAN).is_err());
    }

    #[test]
    fn declines_without_room_between_floor_and_price() {
        let s = sampler(0.1, 0.5, 4, 2.0);
        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(s.sample_at(0.15, 0.25, later), Ok(None));
    }

    #[test]
    fn freshly_stamped_bins_are_not_accepted() {
        let s = sampler(0.1, 0.5, 4, 2.0);
        let now = s.state.lock().last_chosen[0];
        assert_eq!(s.sample_at(0.11, 0.49, now), Ok(None));
    }

    #[test]
    fn starved_bins_are_accepted_inside_bounds() {
        let s = sampler(0.12, 3.79, 40, 2.0);
        let later = Instant::now() + Duration::from_secs(10);
        let px = s
            .sample_at(0.3, 2.2, later)
            .expect("feasible")
            .expect("accepted");
        assert!(px > 0.3 && px < 2.2, "{px}");
    }

    #[test]
    fn most_starved_bin_is_taken_first() {
        let s = sampler(0.1, 0.5, 4, 2.0);
        let t1 = Instant::now() + Duration::from_secs(10);
        let first = s.sample_at(0.11, 0.49, t1).expect("ok").expect("accepted");
        assert!(first >= 0.2 && first <= 0.3 + 1e-9, "{first}");

        let t2 = t1 + Duration::from_millis(1);
        let second = s.sample_at(0.11, 0.49, t2).expect("ok").expect("accepted");
        assert!(second >= 0.3 && second <= 0.4 + 1e-9, "{second}");
    }

    #[test]
    fn seeded_samplers_repeat() {
        let base = Instant::now();
        let build = || {
            AdaptiveRateSampler::build(
                "ctx".to_string(),
                0.12,
                3.79,
                40,
                0.5,
                StdRng::seed_from_u64(11),
                base,
            )
        };
        let a = build();
        let b = build();
        for i in 1..50u64 {
            let now = base + Duration::from_millis(250 * i);
            assert_eq!(a.sample_at(0.5, 3.0, now), b.sample_at(0.5, 3.0, now));
        }
    }

    #[test]
    fn concurrent_sampling_stays_in_range() {
        let s = Arc::new(AdaptiveRateSampler::new("ctx", 0.12, 3.79, 40, 50.0));
        std::thread::sleep(Duration::from_millis(20));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = s.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if let Ok(Some(px)) = s.sample(0.3, 3.5) {
                            assert!(px > 0.3 && px < 3.5);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }
    }
}
