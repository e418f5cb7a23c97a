use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use calibration::CalibrationSettings;
use core_types::PricingConfig;
use serde::Deserialize;

const ENV_PREFIX: &str = "BIDFLOOR_";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AppConfig {
    pub(crate) log_level: String,
    pub(crate) listen_addr: String,
    pub(crate) space_desc_file: PathBuf,
    pub(crate) pricing: PricingConfig,
    pub(crate) sweep_interval: Duration,
    pub(crate) calibration: CalibrationSettings,
    pub(crate) lightgbm_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            listen_addr: "0.0.0.0:8000".to_string(),
            space_desc_file: PathBuf::from("configs/spaces_desc.json"),
            pricing: PricingConfig::default(),
            sweep_interval: Duration::from_millis(2),
            calibration: CalibrationSettings::default(),
            lightgbm_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    optimizer: Option<OptimizerSection>,
    pricing: Option<PricingSection>,
    settlement: Option<SettlementSection>,
    calibration: Option<CalibrationSection>,
}

#[derive(Debug, Deserialize, Default)]
struct OptimizerSection {
    log_level: Option<String>,
    listen_addr: Option<String>,
    space_desc_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct PricingSection {
    levels_per_space: Option<usize>,
    buckets_per_level: Option<usize>,
    buffer_size: Option<usize>,
    discount: Option<f64>,
    desired_exploration_speed: Option<f64>,
    default_feedback_ttl_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SettlementSection {
    sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CalibrationSection {
    poll_secs: Option<u64>,
    threshold: Option<u64>,
    timeout_secs: Option<u64>,
    lightgbm_path: Option<PathBuf>,
}

pub(crate) fn config_path() -> PathBuf {
    std::env::var("BIDFLOOR_CONFIG_PATH")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("configs/optimizer.toml"))
}

/// File (if present) then `BIDFLOOR_*` environment overrides.
pub(crate) fn load_app_config() -> Result<AppConfig> {
    let path = config_path();
    let mut cfg = match fs::read_to_string(&path) {
        Ok(raw) => parse_app_config(&raw).with_context(|| format!("parse {}", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

pub(crate) fn parse_app_config(raw: &str) -> Result<AppConfig> {
    let parsed: ConfigFile = toml::from_str(raw).context("invalid optimizer config")?;
    let mut cfg = AppConfig::default();

    if let Some(section) = parsed.optimizer {
        if let Some(v) = section.log_level {
            cfg.log_level = v;
        }
        if let Some(v) = section.listen_addr {
            cfg.listen_addr = v;
        }
        if let Some(v) = section.space_desc_file {
            cfg.space_desc_file = v;
        }
    }
    if let Some(section) = parsed.pricing {
        let p = &mut cfg.pricing;
        if let Some(v) = section.levels_per_space {
            p.levels_per_space = v;
        }
        if let Some(v) = section.buckets_per_level {
            p.buckets_per_level = v;
        }
        if let Some(v) = section.buffer_size {
            p.buffer_size = v;
        }
        if let Some(v) = section.discount {
            p.discount = v;
        }
        if let Some(v) = section.desired_exploration_speed {
            p.desired_exploration_speed = v;
        }
        if let Some(v) = section.default_feedback_ttl_ms {
            p.default_feedback_ttl_ms = v;
        }
    }
    if let Some(v) = parsed.settlement.and_then(|s| s.sweep_interval_ms) {
        cfg.sweep_interval = Duration::from_millis(v.max(1));
    }
    if let Some(section) = parsed.calibration {
        if let Some(v) = section.poll_secs {
            cfg.calibration.poll_interval = Duration::from_secs(v.max(1));
        }
        if let Some(v) = section.threshold {
            cfg.calibration.threshold = v;
        }
        if let Some(v) = section.timeout_secs {
            cfg.calibration.fit_timeout = Duration::from_secs(v.max(1));
        }
        cfg.lightgbm_path = section.lightgbm_path;
    }
    Ok(cfg)
}

fn env_value<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let key = format!("{ENV_PREFIX}{name}");
    let raw = lookup(&key)?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key = %key, value = raw, "ignoring unparsable config override");
            None
        }
    }
}

pub(crate) fn apply_env_overrides(cfg: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = env_value(&lookup, "BUFFER_SIZE") {
        cfg.pricing.buffer_size = v;
    }
    if let Some(v) = env_value(&lookup, "DISCOUNT") {
        cfg.pricing.discount = v;
    }
    if let Some(v) = env_value(&lookup, "DESIRED_EXPLORATION_SPEED") {
        cfg.pricing.desired_exploration_speed = v;
    }
    if let Some(v) = env_value(&lookup, "LEVEL_SIZE") {
        cfg.pricing.levels_per_space = v;
    }
    if let Some(v) = env_value(&lookup, "BUCKET_SIZE") {
        cfg.pricing.buckets_per_level = v;
    }
    if let Some(v) = env_value(&lookup, "FEEDBACK_TTL_MS") {
        cfg.pricing.default_feedback_ttl_ms = v;
    }
    if let Some(v) = env_value::<String>(&lookup, "LOG_LEVEL") {
        cfg.log_level = v;
    }
    if let Some(v) = env_value::<PathBuf>(&lookup, "SPACE_DESC_FILE") {
        cfg.space_desc_file = v;
    }
    if let Some(v) = env_value::<String>(&lookup, "LISTEN_ADDR") {
        cfg.listen_addr = v;
    }
    if let Some(v) = env_value::<u64>(&lookup, "SWEEP_INTERVAL_MS") {
        cfg.sweep_interval = Duration::from_millis(v.max(1));
    }
    if let Some(v) = env_value::<u64>(&lookup, "CALIBRATION_POLL_SECS") {
        cfg.calibration.poll_interval = Duration::from_secs(v.max(1));
    }
    if let Some(v) = env_value(&lookup, "CALIBRATION_THRESHOLD") {
        cfg.calibration.threshold = v;
    }
    if let Some(v) = env_value::<u64>(&lookup, "CALIBRATION_TIMEOUT_SECS") {
        cfg.calibration.fit_timeout = Duration::from_secs(v.max(1));
    }
    if let Some(v) = env_value::<PathBuf>(&lookup, "LIGHTGBM_PATH") {
        cfg.lightgbm_path = Some(v);
    }
}
