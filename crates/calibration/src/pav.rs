use anyhow::Result;
use async_trait::async_trait;
use core_types::{Calibrator, FitSample};

#[derive(Debug, Clone, Copy)]
struct Block {
    sum: f64,
    weight: f64,
    len: usize,
}

impl Block {
    fn mean(&self) -> f64 {
        self.sum / self.weight
    }
}

/// Weighted isotonic regression (pool adjacent violators).
///
/// Returns the non-decreasing sequence closest to `values` in weighted
/// least squares. Missing or non-positive weights count as 1.
pub fn isotonic_fit(values: &[f64], weights: Option<&[f64]>) -> Vec<f64> {
    let mut blocks: Vec<Block> = Vec::with_capacity(values.len());
    for (i, &y) in values.iter().enumerate() {
        let w = weights
            .and_then(|ws| ws.get(i).copied())
            .filter(|w| *w > 0.0 && w.is_finite())
            .unwrap_or(1.0);
        blocks.push(Block {
            sum: y * w,
            weight: w,
            len: 1,
        });
        while blocks.len() >= 2 {
            let last = blocks[blocks.len() - 1];
            let prev = blocks[blocks.len() - 2];
            if prev.mean() <= last.mean() {
                break;
            }
            blocks.pop();
            if let Some(merged) = blocks.last_mut() {
                merged.sum += last.sum;
                merged.weight += last.weight;
                merged.len += last.len;
            }
        }
    }

    let mut fitted = Vec::with_capacity(values.len());
    for block in &blocks {
        let mean = block.mean();
        fitted.extend(std::iter::repeat(mean).take(block.len));
    }
    fitted
}

/// In-process monotone fitter over bucket win rates.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolAdjacentViolators;

#[async_trait]
impl Calibrator for PoolAdjacentViolators {
    async fn fit(&self, samples: &[FitSample]) -> Result<Vec<f64>> {
        // fit in price order, report in input order
        let mut order: Vec<usize> = (0..samples.len()).collect();
        order.sort_by(|a, b| samples[*a].price.total_cmp(&samples[*b].price));
        let sorted: Vec<f64> = order.iter().map(|i| samples[*i].pr).collect();

        let mut out = vec![0.0; samples.len()];
        for (slot, value) in order.into_iter().zip(isotonic_fit(&sorted, None)) {
            out[slot] = value;
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "pav"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-12)
    }

    #[test]
    fn pools_single_violation() {
        let got = isotonic_fit(&[0.1, 0.5, 0.3, 0.7], None);
        assert!(close(&got, &[0.1, 0.4, 0.4, 0.7]), "{got:?}");
    }

    #[test]
    fn monotone_input_is_unchanged() {
        let input = [0.1, 0.2, 0.2, 0.9];
        assert!(close(&isotonic_fit(&input, None), &input));
    }

    #[test]
    fn decreasing_input_collapses_to_mean() {
        let got = isotonic_fit(&[0.9, 0.6, 0.3], None);
        assert!(close(&got, &[0.6, 0.6, 0.6]), "{got:?}");
    }

    #[test]
    fn weights_pull_pooled_value() {
        let got = isotonic_fit(&[0.8, 0.2], Some(&[3.0, 1.0]));
        assert!(close(&got, &[0.65, 0.65]), "{got:?}");
    }

    #[tokio::test]
    async fn calibrator_keeps_input_order() {
        let samples = [
            FitSample { price: 3.0, pr: 0.2 },
            FitSample { price: 1.0, pr: 0.1 },
            FitSample { price: 2.0, pr: 0.5 },
        ];
        let got = PoolAdjacentViolators.fit(&samples).await.expect("fit");
        // price order is 1.0, 2.0, 3.0 -> [0.1, 0.35, 0.35]
        assert!(close(&got, &[0.35, 0.1, 0.35]), "{got:?}");
        assert!(PoolAdjacentViolators.fit(&[]).await.expect("empty").is_empty());
    }
}
