use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

pub const RECENT_CAPACITY: usize = 10;

/// TTL for new pending explorations, sized from recent feedback latency.
#[derive(Debug)]
pub struct AdaptiveTimeoutEstimator {
    recent: Mutex<VecDeque<Duration>>,
    default_ttl: Duration,
}

impl Default for AdaptiveTimeoutEstimator {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl AdaptiveTimeoutEstimator {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
            default_ttl,
        }
    }

    /// Newest first; the oldest latency falls off once the window is full.
    pub fn record(&self, latency: Duration) {
        let mut recent = self.recent.lock();
        recent.push_front(latency);
        recent.truncate(RECENT_CAPACITY);
    }

    /// Twice the mean of the stored latencies, or the default with no history.
    pub fn time(&self) -> Duration {
        let recent = self.recent.lock();
        let total: Duration = recent.iter().sum();
        if total.is_zero() {
            return self.default_ttl;
        }
        (total / recent.len() as u32) * 2
    }

    pub fn recent(&self) -> Vec<Duration> {
        self.recent.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.recent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.lock().is_empty()
    }
}
