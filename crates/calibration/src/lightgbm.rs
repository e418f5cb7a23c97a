use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use core_types::{Calibrator, FitSample};
use tokio::process::Command;

use crate::pav::isotonic_fit;

/// Training knobs written into the `lightgbm` train config.
#[derive(Debug, Clone, PartialEq)]
pub struct LightGbmParams {
    pub num_trees: u32,
    pub learning_rate: f64,
    pub num_leaves: u32,
    pub min_child_samples: u32,
}

impl Default for LightGbmParams {
    fn default() -> Self {
        Self {
            num_trees: 100,
            learning_rate: 0.1,
            num_leaves: 31,
            min_child_samples: 2,
        }
    }
}

/// Fits winning curves with the external `lightgbm` CLI.
///
/// Every fit runs in its own temp directory, so concurrent level fits never
/// share model or output files. Predictions get a final isotonic pass:
/// the monotone constraint on the price feature is advisory in boosting.
#[derive(Debug, Clone)]
pub struct LightGbmCalibrator {
    executable: PathBuf,
    params: LightGbmParams,
}

impl LightGbmCalibrator {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            params: LightGbmParams::default(),
        }
    }

    pub fn with_params(mut self, params: LightGbmParams) -> Self {
        self.params = params;
        self
    }

    /// Looks `lightgbm` up on `PATH`.
    pub fn from_path() -> Option<Self> {
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join("lightgbm"))
            .find(|candidate| candidate.is_file())
            .map(Self::new)
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn train_config(&self, data: &Path, model: &Path) -> String {
        let p = &self.params;
        format!(
            "task = train\n\
             boosting_type = gbdt\n\
             objective = regression\n\
             metric = l2\n\
             metric_freq = 1\n\
             is_training_metric = false\n\
             label_column = 0\n\
             data = {data}\n\
             num_trees = {trees}\n\
             learning_rate = {lr}\n\
             num_leaves = {leaves}\n\
             min_child_samples = {min_child}\n\
             mc = 1\n\
             tree_learner = serial\n\
             is_enable_sparse = true\n\
             use_two_round_loading = false\n\
             is_save_binary_file = false\n\
             output_model = {model}\n",
            data = data.display(),
            trees = p.num_trees,
            lr = p.learning_rate,
            leaves = p.num_leaves,
            min_child = p.min_child_samples,
            model = model.display(),
        )
    }

    fn predict_config(data: &Path, output: &Path, model: &Path) -> String {
        format!(
            "task = predict\ndata = {}\noutput_result = {}\ninput_model = {}\n",
            data.display(),
            output.display(),
            model.display()
        )
    }

    /// The child is killed if the returned future is dropped, so a fit
    /// timeout also stops the process.
    async fn run(&self, config: &Path, stage: &str) -> Result<()> {
        let out = Command::new(&self.executable)
            .arg(format!("config={}", config.display()))
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("spawn {} for {stage}", self.executable.display()))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            bail!("lightgbm {stage} failed ({}): {}", out.status, stderr.trim());
        }
        Ok(())
    }
}

/// Label then feature, tab separated, one bucket per line.
fn training_rows(samples: &[FitSample]) -> String {
    samples
        .iter()
        .map(|s| format!("{:.6}\t{:.6}\n", s.pr, s.price))
        .collect()
}

/// One prediction per line; unparsable lines read as 0.
fn parse_predictions(raw: &str) -> Vec<f64> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.trim().parse::<f64>().unwrap_or_else(|_| {
                tracing::warn!(line, "unparsable lightgbm prediction");
                0.0
            })
        })
        .collect()
}

#[async_trait]
impl Calibrator for LightGbmCalibrator {
    async fn fit(&self, samples: &[FitSample]) -> Result<Vec<f64>> {
        let dir = tempfile::Builder::new()
            .prefix("calibration")
            .tempdir()
            .context("create calibration temp dir")?;
        let data = dir.path().join("regression.train");
        let model = dir.path().join("model.txt");
        let output = dir.path().join("predictions.txt");
        let train_conf = dir.path().join("train.conf");
        let predict_conf = dir.path().join("predict.conf");

        tokio::fs::write(&data, training_rows(samples))
            .await
            .context("write training data")?;
        tokio::fs::write(&train_conf, self.train_config(&data, &model))
            .await
            .context("write train config")?;
        tokio::fs::write(&predict_conf, Self::predict_config(&data, &output, &model))
            .await
            .context("write predict config")?;

        self.run(&train_conf, "training").await?;
        self.run(&predict_conf, "prediction").await?;

        let raw = tokio::fs::read_to_string(&output)
            .await
            .with_context(|| format!("read predictions {}", output.display()))?;
        let predictions = parse_predictions(&raw);
        if predictions.len() != samples.len() {
            bail!(
                "lightgbm returned {} predictions for {} samples",
                predictions.len(),
                samples.len()
            );
        }
        Ok(isotonic_fit(&predictions, None))
    }

    fn name(&self) -> &'static str {
        "lightgbm"
    }
}
