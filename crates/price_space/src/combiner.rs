/// Folds per-level exploit recommendations into one price.
pub trait LevelCombiner: Send + Sync {
    /// `None` when there is nothing to combine.
    fn combine(&self, recommendations: &[f64]) -> Option<f64>;

    fn name(&self) -> &'static str;
}

/// Arithmetic mean of the levels that produced a recommendation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanCombiner;

impl LevelCombiner for MeanCombiner {
    fn combine(&self, recommendations: &[f64]) -> Option<f64> {
        if recommendations.is_empty() {
            return None;
        }
        Some(recommendations.iter().sum::<f64>() / recommendations.len() as f64)
    }

    fn name(&self) -> &'static str {
        "mean"
    }
}

/// Median, averaging the two middle values for an even count.
#[derive(Debug, Clone, Copy, Default)]
pub struct MedianCombiner;

impl LevelCombiner for MedianCombiner {
    fn combine(&self, recommendations: &[f64]) -> Option<f64> {
        if recommendations.is_empty() {
            return None;
        }
        let mut sorted = recommendations.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 1 {
            Some(sorted[mid])
        } else {
            Some((sorted[mid - 1] + sorted[mid]) / 2.0)
        }
    }

    fn name(&self) -> &'static str {
        "median"
    }
}
