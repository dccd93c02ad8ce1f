//! Configuration loading and merging
//!
//! Priority, highest first: command line, `--config` file,
//! `./cachescope.toml`, built-in defaults.

use anyhow::{Context, Result};
use cachescope_analysis::ClassifierConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

const DEFAULT_CONFIG_FILE: &str = "cachescope.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralConfig {
    /// Default log file path (overridden by --log-file)
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            log_file: default_log_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecorderConfig {
    /// Sampling event list; empty means pick by CPU vendor
    #[serde(default)]
    pub event: String,
    /// Sample period (overridden by -c)
    #[serde(default = "default_sample_period")]
    pub sample_period: u64,
    /// Recorder output file (overridden by -o)
    #[serde(default = "default_perf_data")]
    pub perf_data: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        RecorderConfig {
            event: String::new(),
            sample_period: default_sample_period(),
            perf_data: default_perf_data(),
        }
    }
}

/// Classifier thresholds; defaults are the calibrated constants.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThresholdConfig {
    #[serde(default = "default_min_hot_samples")]
    pub min_hot_samples: u64,
    #[serde(default = "default_write_read_hot_ratio")]
    pub write_read_hot_ratio: f64,
    #[serde(default = "default_min_bounce_score")]
    pub min_bounce_score: f64,
    #[serde(default = "default_min_private_offset_fraction")]
    pub min_private_offset_fraction: f64,
    #[serde(default = "default_min_unique_top_offsets")]
    pub min_unique_top_offsets: usize,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        ThresholdConfig {
            min_hot_samples: default_min_hot_samples(),
            write_read_hot_ratio: default_write_read_hot_ratio(),
            min_bounce_score: default_min_bounce_score(),
            min_private_offset_fraction: default_min_private_offset_fraction(),
            min_unique_top_offsets: default_min_unique_top_offsets(),
        }
    }
}

impl ThresholdConfig {
    pub fn to_classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            min_hot_samples: self.min_hot_samples,
            write_read_hot_ratio: self.write_read_hot_ratio,
            min_bounce_score: self.min_bounce_score,
            min_private_offset_fraction: self.min_private_offset_fraction,
            min_unique_top_offsets: self.min_unique_top_offsets,
        }
    }
}

fn default_log_file() -> String {
    "cachescope.log".to_string()
}

fn default_sample_period() -> u64 {
    10_000
}

fn default_perf_data() -> String {
    "perf.data".to_string()
}

fn default_min_hot_samples() -> u64 {
    1000
}

fn default_write_read_hot_ratio() -> f64 {
    5.0
}

fn default_min_bounce_score() -> f64 {
    0.10
}

fn default_min_private_offset_fraction() -> f64 {
    0.50
}

fn default_min_unique_top_offsets() -> usize {
    2
}

impl Config {
    /// Load configuration: an explicit `--config` path must exist, the
    /// implicit `./cachescope.toml` is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Config> {
        if let Some(path) = explicit {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            return toml::from_str(&content)
                .with_context(|| format!("failed to parse config {}", path.display()));
        }
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        if default_path.is_file() {
            let content = std::fs::read_to_string(&default_path)?;
            match toml::from_str(&content) {
                Ok(config) => return Ok(config),
                Err(e) => debug!("ignoring malformed {}: {}", DEFAULT_CONFIG_FILE, e),
            }
        }
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_calibrated_constants() {
        let config = Config::default();
        assert_eq!(config.thresholds.min_hot_samples, 1000);
        assert_eq!(config.thresholds.write_read_hot_ratio, 5.0);
        assert_eq!(config.thresholds.min_bounce_score, 0.10);
        assert_eq!(config.thresholds.min_private_offset_fraction, 0.50);
        assert_eq!(config.thresholds.min_unique_top_offsets, 2);
        assert_eq!(config.recorder.sample_period, 10_000);
        assert_eq!(config.recorder.perf_data, "perf.data");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: Config = toml::from_str(
            "[thresholds]\nmin_hot_samples = 50\n\n[recorder]\nevent = \"cpu-cycles\"\n",
        )
        .unwrap();
        assert_eq!(config.thresholds.min_hot_samples, 50);
        assert_eq!(config.thresholds.min_unique_top_offsets, 2);
        assert_eq!(config.recorder.event, "cpu-cycles");
        assert_eq!(config.recorder.sample_period, 10_000);
    }
}
