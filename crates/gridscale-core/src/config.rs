//! gridscale.toml configuration parser.
//!
//! Global options plus one `[[group]]` table per node group. Durations are
//! human strings (`"10s"`, `"5m"`); unknown keys are rejected so typos fail
//! loudly at startup.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::types::{ExpanderStrategy, NodeGroupSpec};

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration for the daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GridConfig {
    /// How often the decision loop ticks (default 10s).
    pub scan_interval: Option<String>,
    /// Whether scale-down is considered at all (default true).
    pub scale_down_enabled: Option<bool>,
    /// How long a node must stay under-utilized before it is a scale-down
    /// candidate (default 10m).
    pub scale_down_unneeded_time: Option<String>,
    /// Utilization below which a node counts as unneeded, 0..1 (default 0.5).
    pub scale_down_utilization_threshold: Option<f64>,
    /// Maximum nodes drained per tick across all groups (default 10).
    pub max_concurrent_drain: Option<u32>,
    /// Group-selection policy for scale-up (default random).
    pub expander: Option<ExpanderStrategy>,
    /// Cordon a node before asking the backend to delete it (default false).
    pub cordon_node_before_terminating: Option<bool>,
    /// Minimum wall-clock between consecutive mutations on one group
    /// (default 3m).
    pub cooldown: Option<String>,

    #[serde(default, rename = "group")]
    pub groups: Vec<GroupConfig>,
}

/// Per-group configuration table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GroupConfig {
    pub name: String,
    pub min_size: u32,
    pub max_size: u32,
    /// Override for the size cache TTL in seconds (default 15).
    pub cache_ttl_seconds: Option<u64>,
    /// Ranking used by the priority expander (default 0).
    pub priority: Option<i32>,
}

impl GridConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: GridConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every bound the engine relies on; collects all violations into
    /// one message so an operator fixes the file in a single pass.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.groups.is_empty() {
            problems.push("at least one [[group]] is required".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for group in &self.groups {
            if group.name.trim().is_empty() {
                problems.push("group name must not be empty".to_string());
            }
            if !seen.insert(group.name.to_ascii_lowercase()) {
                problems.push(format!("duplicate group name: {}", group.name));
            }
            if group.min_size > group.max_size {
                problems.push(format!(
                    "group {}: min-size {} exceeds max-size {}",
                    group.name, group.min_size, group.max_size
                ));
            }
        }

        if let Some(threshold) = self.scale_down_utilization_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                problems.push(format!(
                    "scale-down-utilization-threshold must be within 0..1, got {threshold}"
                ));
            }
        }

        for (key, value) in [
            ("scan-interval", &self.scan_interval),
            ("scale-down-unneeded-time", &self.scale_down_unneeded_time),
            ("cooldown", &self.cooldown),
        ] {
            if let Some(raw) = value {
                if parse_duration(raw).is_none() {
                    problems.push(format!("{key}: cannot parse duration {raw:?}"));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }

    /// The configured node groups as immutable specs.
    pub fn node_groups(&self) -> Vec<NodeGroupSpec> {
        self.groups
            .iter()
            .map(|g| NodeGroupSpec {
                name: g.name.clone(),
                min_size: g.min_size,
                max_size: g.max_size,
                size_ttl_seconds: g.cache_ttl_seconds,
                priority: g.priority.unwrap_or(0),
            })
            .collect()
    }

    // ── Accessors with defaults ────────────────────────────────────

    pub fn scan_interval(&self) -> Duration {
        self.duration_or(&self.scan_interval, Duration::from_secs(10))
    }

    pub fn scale_down_enabled(&self) -> bool {
        self.scale_down_enabled.unwrap_or(true)
    }

    pub fn scale_down_unneeded_time(&self) -> Duration {
        self.duration_or(&self.scale_down_unneeded_time, Duration::from_secs(600))
    }

    pub fn scale_down_utilization_threshold(&self) -> f64 {
        self.scale_down_utilization_threshold.unwrap_or(0.5)
    }

    pub fn max_concurrent_drain(&self) -> u32 {
        self.max_concurrent_drain.unwrap_or(10)
    }

    pub fn expander(&self) -> ExpanderStrategy {
        self.expander.unwrap_or_default()
    }

    pub fn cordon_node_before_terminating(&self) -> bool {
        self.cordon_node_before_terminating.unwrap_or(false)
    }

    pub fn cooldown(&self) -> Duration {
        self.duration_or(&self.cooldown, Duration::from_secs(180))
    }

    fn duration_or(&self, value: &Option<String>, default: Duration) -> Duration {
        value
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(default)
    }
}

/// Parse a duration string like "10s", "500ms", "5m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(rest) = s.strip_suffix("ms") {
        rest.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(rest) = s.strip_suffix('s') {
        rest.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(rest) = s.strip_suffix('m') {
        rest.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(rest) = s.strip_suffix('h') {
        rest.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
