//! Configuration management for Fanout

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ConfigError, Result};
use crate::segmenter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub poll: PollConfig,
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Seconds between polls for new items.
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    /// Seconds between deletion-reconciliation passes.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// How many recent items to fetch per poll.
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            reconcile_interval_secs: default_reconcile_interval(),
            fetch_limit: default_fetch_limit(),
        }
    }
}

fn default_poll_interval() -> u64 {
    60
}

fn default_reconcile_interval() -> u64 {
    900
}

fn default_fetch_limit() -> u32 {
    50
}

/// Length-counting rule for a target. Length semantics differ per
/// platform, so the counting function is injected into the segmenter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CountRule {
    /// Raw grapheme-cluster count.
    #[default]
    Graphemes,
    /// Wide characters count double, link-like substrings count as a
    /// fixed weight.
    Weighted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    /// Per-segment length budget.
    pub max_length: usize,
    #[serde(default)]
    pub counting: CountRule,
    /// Worker concurrency. Targets with pacing requirements use 1.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Minimum spacing between jobs when concurrency is 1.
    #[serde(default)]
    pub min_interval_secs: u64,
    /// Daily cap on successful sub-posts, if the target has one.
    #[serde(default)]
    pub daily_limit: Option<u32>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential backoff, doubled each attempt.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
}

fn default_concurrency() -> usize {
    2
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    5
}

impl TargetConfig {
    /// Count `text` under this target's length rule.
    pub fn count(&self, text: &str) -> usize {
        match self.counting {
            CountRule::Graphemes => segmenter::grapheme_len(text),
            CountRule::Weighted => segmenter::weighted_len(text),
        }
    }

    /// Split `text` into segments under this target's budget and rule.
    pub fn segment(&self, text: &str) -> Vec<String> {
        let count: &dyn Fn(&str) -> usize = match self.counting {
            CountRule::Graphemes => &segmenter::grapheme_len,
            CountRule::Weighted => &segmenter::weighted_len,
        };
        segmenter::segment(text, self.max_length, count)
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/fanout/fanout.db".to_string(),
            },
            poll: PollConfig::default(),
            targets: vec![
                TargetConfig {
                    name: "shortform".to_string(),
                    max_length: 280,
                    counting: CountRule::Weighted,
                    concurrency: 1,
                    min_interval_secs: 60,
                    daily_limit: Some(17),
                    max_attempts: 5,
                    backoff_base_secs: 5,
                },
                TargetConfig {
                    name: "fediverse".to_string(),
                    max_length: 500,
                    counting: CountRule::Graphemes,
                    concurrency: 2,
                    min_interval_secs: 0,
                    daily_limit: None,
                    max_attempts: 5,
                    backoff_base_secs: 5,
                },
            ],
        }
    }

    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("FANOUT_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("fanout").join("config.toml"))
}

/// Resolve the data directory path following XDG Base Directory spec
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("fanout"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml_str = r#"
            [database]
            path = "/tmp/fanout.db"

            [[targets]]
            name = "shortform"
            max_length = 280
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database.path, "/tmp/fanout.db");
        assert_eq!(config.poll.interval_secs, 60);
        assert_eq!(config.targets.len(), 1);

        let target = &config.targets[0];
        assert_eq!(target.name, "shortform");
        assert_eq!(target.max_length, 280);
        assert_eq!(target.counting, CountRule::Graphemes);
        assert_eq!(target.concurrency, 2);
        assert_eq!(target.min_interval_secs, 0);
        assert_eq!(target.daily_limit, None);
        assert_eq!(target.max_attempts, 5);
    }

    #[test]
    fn test_parse_full_target_section() {
        let toml_str = r#"
            [database]
            path = "/tmp/fanout.db"

            [poll]
            interval_secs = 30
            reconcile_interval_secs = 600
            fetch_limit = 25

            [[targets]]
            name = "shortform"
            max_length = 280
            counting = "weighted"
            concurrency = 1
            min_interval_secs = 90
            daily_limit = 17
            max_attempts = 3
            backoff_base_secs = 10
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.poll.fetch_limit, 25);

        let target = config.target("shortform").unwrap();
        assert_eq!(target.counting, CountRule::Weighted);
        assert_eq!(target.concurrency, 1);
        assert_eq!(target.min_interval_secs, 90);
        assert_eq!(target.daily_limit, Some(17));
        assert_eq!(target.max_attempts, 3);
        assert_eq!(target.backoff_base_secs, 10);
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let config = Config::default_config();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.targets.len(), config.targets.len());
        assert_eq!(parsed.target("shortform").unwrap().daily_limit, Some(17));
    }

    #[test]
    fn test_target_count_rules_differ() {
        let config = Config::default_config();
        let weighted = config.target("shortform").unwrap();
        let graphemes = config.target("fediverse").unwrap();

        // A link is a fixed weight under the weighted rule but counted
        // cluster by cluster under the raw rule.
        let text = "see https://example.com/a/very/long/path/that/keeps/going";
        assert!(weighted.count(text) < graphemes.count(text));
    }

    #[test]
    fn test_unknown_target_lookup() {
        let config = Config::default_config();
        assert!(config.target("nope").is_none());
    }
}
