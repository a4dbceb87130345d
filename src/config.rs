//! Configuration for card decoding and nightly aggregation.

use crate::breath::BreathConfig;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the analytics pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Options for the daily aggregator
    pub aggregator: AggregatorConfig,

    /// Options for decoding a card's files
    pub import: ImportConfig,
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| ConfigError::IoError(e.to_string()))?;
            Self::from_json(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from JSON; missing fields take their defaults.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(&config_path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cpap-card-analytics")
            .join("config.json")
    }
}

/// Named options of the daily aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Large-leak threshold (L/min) used only when a night has no leak samples
    pub leak_over_threshold: f64,

    /// Noise floor for weighted-interval construction (seconds)
    pub min_sample_segment_secs: f64,

    /// Zone whose calendar days define the buckets
    pub timezone: Tz,

    /// Snore events closer than this join one episode (seconds)
    pub snore_episode_gap_secs: f64,

    /// Shortest leak-over-threshold run kept as an episode (seconds)
    pub leak_episode_min_secs: f64,

    /// Leak runs separated by less than this are joined (seconds)
    pub leak_episode_gap_secs: f64,

    /// Window lengths of the rolling AHI series (minutes)
    pub rolling_ahi_windows_min: Vec<u32>,

    /// Breath segmentation tuning
    pub breath: BreathConfig,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            leak_over_threshold: 24.0,
            min_sample_segment_secs: 1.0,
            timezone: Tz::UTC,
            snore_episode_gap_secs: 120.0,
            leak_episode_min_secs: 60.0,
            leak_episode_gap_secs: 60.0,
            rolling_ahi_windows_min: vec![5, 10, 30],
            breath: BreathConfig::default(),
        }
    }
}

impl AggregatorConfig {
    /// Parse an IANA zone name (e.g. `Europe/Berlin`).
    pub fn with_timezone(mut self, name: &str) -> Result<Self, ConfigError> {
        self.timezone = name
            .parse::<Tz>()
            .map_err(|e| ConfigError::ParseError(format!("timezone '{name}': {e}")))?;
        Ok(self)
    }
}

/// Options for decoding the files of one card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Number of threads decoding files in parallel
    pub workers: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(8),
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.aggregator.leak_over_threshold, 24.0);
        assert_eq!(config.aggregator.min_sample_segment_secs, 1.0);
        assert_eq!(config.aggregator.timezone, Tz::UTC);
        assert_eq!(config.aggregator.rolling_ahi_windows_min, vec![5, 10, 30]);
        assert!(config.import.workers >= 1);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config =
            Config::from_json(r#"{ "aggregator": { "timezone": "America/New_York" } }"#).unwrap();
        assert_eq!(config.aggregator.timezone, chrono_tz::America::New_York);
        assert_eq!(config.aggregator.leak_over_threshold, 24.0);
    }

    #[test]
    fn test_timezone_parsing() {
        let config = AggregatorConfig::default()
            .with_timezone("Europe/Berlin")
            .unwrap();
        assert_eq!(config.timezone, chrono_tz::Europe::Berlin);

        assert!(AggregatorConfig::default()
            .with_timezone("Mars/Olympus_Mons")
            .is_err());
    }

    #[test]
    fn test_round_trip_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(Config::from_json(&json).unwrap(), config);
    }
}
