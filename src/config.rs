//! TOML-based node settings, simulated tree layout, and preset definitions.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::profile::Category;

/// Top-level configuration parsed from TOML.
///
/// All sections have defaults. Load from TOML with
/// [`TreeConfig::from_toml_file`] or start from one of the
/// [`TreeConfig::PRESETS`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreeConfig {
    /// Settings shared by every node in the tree.
    #[serde(default)]
    pub node: NodeConfig,
    /// Simulated time and the contract request sent to the root.
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Aggregation points; exactly one of them has no parent.
    #[serde(default)]
    pub aggregators: Vec<AggregatorConfig>,
    /// Simulated DERs attached to aggregators.
    #[serde(default)]
    pub leaves: Vec<LeafConfig>,
}

/// Per-node control settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Length of one timeslot in minutes.
    pub timeslot_minutes: u32,
    /// Deviation (W) below which an aggregator does not steer.
    pub steer_limit_watts: f64,
    /// Multiplier on the deviation/headroom ratio when apportioning
    /// corrections across children.
    pub allocation_gain: f64,
    /// Report this long after every slot boundary; `0` disables.
    pub send_offset_ms: i64,
    /// Report on a fixed interval; `0` disables.
    pub send_interval_ms: i64,
    /// Delay of the first report after start-up.
    pub initial_report_delay_ms: i64,
    /// Never report upward.
    pub skip_reports: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            timeslot_minutes: 15,
            steer_limit_watts: 100.0,
            allocation_gain: 2.0,
            send_offset_ms: 0,
            send_interval_ms: 0,
            initial_report_delay_ms: 60_000,
            skip_reports: false,
        }
    }
}

impl NodeConfig {
    /// Timeslot length as a duration.
    pub fn timeslot(&self) -> Duration {
        Duration::minutes(i64::from(self.timeslot_minutes))
    }
}

/// Simulated run parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Simulated start instant (RFC 3339 string).
    pub start: DateTime<Utc>,
    /// Simulated duration in hours (must be > 0).
    pub hours: u32,
    /// Interval between leaf model updates in seconds (must be > 0).
    pub tick_seconds: u32,
    /// Master random seed.
    pub seed: u64,
    /// Step (W) added to the root's demand in the contract request.
    pub request_watts: f64,
    /// Minutes after start at which the root receives the request.
    pub request_at_minutes: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            start: DateTime::from_timestamp_millis(1_451_606_400_000).unwrap_or_default(),
            hours: 2,
            tick_seconds: 60,
            seed: 42,
            request_watts: -500.0,
            request_at_minutes: 20,
        }
    }
}

/// An aggregation point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregatorConfig {
    pub id: String,
    /// Parent aggregator; `None` for the root.
    #[serde(default)]
    pub parent: Option<String>,
}

/// One step of a leaf's daily usage spread.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsageStep {
    pub seconds_of_day: u32,
    /// Percentage of `max_consumption`.
    pub usage_percentage: f64,
}

/// A simulated DER.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeafConfig {
    pub id: String,
    /// Aggregator this leaf reports to.
    pub parent: String,
    /// Category the leaf reports under.
    pub category: Category,
    /// Maximum consumption (W).
    pub max_consumption: f64,
    /// Upper flexibility bound as a percentage of `max_consumption`.
    pub max_flex: f64,
    /// Lower flexibility bound as a percentage of `max_consumption`.
    pub min_flex: f64,
    /// How far ahead the forecast reaches.
    pub forecast_horizon_hours: u32,
    /// Daily usage pattern, sorted by `seconds_of_day`.
    pub timespread: Vec<UsageStep>,
    /// Amplitude (W) of the periodically refreshed random deviation.
    pub random_offset: f64,
    /// Local generation (W) subtracted from the lower flexibility bound.
    pub generation_offset: f64,
    /// Initial user-induced deviation (W).
    pub trick_offset: f64,
    /// Let simulated users occasionally override consumption.
    pub user_events: bool,
}

impl Default for LeafConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            parent: String::new(),
            category: Category::Simulated,
            max_consumption: 1000.0,
            max_flex: 100.0,
            min_flex: 0.0,
            forecast_horizon_hours: 13,
            timespread: default_timespread(),
            random_offset: 0.0,
            generation_offset: 0.0,
            trick_offset: 0.0,
            user_events: false,
        }
    }
}

fn default_timespread() -> Vec<UsageStep> {
    [(0, 30.0), (21_600, 55.0), (43_200, 70.0), (64_800, 65.0), (79_200, 40.0)]
        .into_iter()
        .map(|(seconds_of_day, usage_percentage)| UsageStep {
            seconds_of_day,
            usage_percentage,
        })
        .collect()
}

/// Configuration error with field path and constraint description.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigError {
    /// Dotted field path (e.g., `"node.timeslot_minutes"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl ConfigError {
    pub(crate) fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

impl TreeConfig {
    /// Node settings of the presets: every node reports 10 s after each
    /// slot boundary.
    fn preset_node() -> NodeConfig {
        NodeConfig {
            send_offset_ms: 10_000,
            ..NodeConfig::default()
        }
    }

    /// One bus aggregator with three DERs of different categories.
    pub fn single_bus() -> Self {
        let leaf = |id: &str, category, max_consumption, min_flex| LeafConfig {
            id: id.to_string(),
            parent: "bus_0".to_string(),
            category,
            max_consumption,
            min_flex,
            random_offset: 20.0,
            ..LeafConfig::default()
        };
        Self {
            node: Self::preset_node(),
            simulation: SimulationConfig::default(),
            aggregators: vec![AggregatorConfig {
                id: "bus_0".to_string(),
                parent: None,
            }],
            leaves: vec![
                leaf("hvac_1", Category::Hvac, 3000.0, 10.0),
                leaf("light_1", Category::Lighting, 800.0, 20.0),
                leaf("other_1", Category::Other, 1500.0, 0.0),
            ],
        }
    }

    /// A bus over two feeders with two DERs each.
    pub fn two_level() -> Self {
        let feeder = |id: &str| AggregatorConfig {
            id: id.to_string(),
            parent: Some("bus_0".to_string()),
        };
        let leaf = |id: &str, parent: &str, category, max_consumption| LeafConfig {
            id: id.to_string(),
            parent: parent.to_string(),
            category,
            max_consumption,
            min_flex: 10.0,
            random_offset: 30.0,
            ..LeafConfig::default()
        };
        Self {
            node: Self::preset_node(),
            simulation: SimulationConfig {
                hours: 3,
                request_watts: -1200.0,
                ..SimulationConfig::default()
            },
            aggregators: vec![
                AggregatorConfig {
                    id: "bus_0".to_string(),
                    parent: None,
                },
                feeder("feeder_a"),
                feeder("feeder_b"),
            ],
            leaves: vec![
                leaf("hvac_a", "feeder_a", Category::Hvac, 4000.0),
                leaf("light_a", "feeder_a", Category::Lighting, 1200.0),
                leaf("hvac_b", "feeder_b", Category::Hvac, 3500.0),
                LeafConfig {
                    generation_offset: 300.0,
                    ..leaf("pv_b", "feeder_b", Category::Production, 2000.0)
                },
            ],
        }
    }

    /// Available preset names.
    pub const PRESETS: &[&str] = &["single_bus", "two_level"];

    /// Loads a tree from a named preset.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the preset name is unknown.
    pub fn from_preset(name: &str) -> Result<Self, ConfigError> {
        match name {
            "single_bus" => Ok(Self::single_bus()),
            "two_level" => Ok(Self::two_level()),
            _ => Err(ConfigError::new(
                "preset",
                format!(
                    "unknown preset \"{name}\", available: {}",
                    Self::PRESETS.join(", ")
                ),
            )),
        }
    }

    /// Parses a tree from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::new("scenario", format!("cannot read \"{}\": {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a tree from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::new("toml", e.to_string()))
    }

    /// Id of the aggregator without a parent, if there is exactly one.
    pub fn root(&self) -> Option<&str> {
        let mut roots = self.aggregators.iter().filter(|a| a.parent.is_none());
        match (roots.next(), roots.next()) {
            (Some(root), None) => Some(root.id.as_str()),
            _ => None,
        }
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        let n = &self.node;
        if n.timeslot_minutes == 0 {
            errors.push(ConfigError::new("node.timeslot_minutes", "must be > 0"));
        }
        if !(n.steer_limit_watts > 0.0) {
            errors.push(ConfigError::new("node.steer_limit_watts", "must be > 0"));
        }
        if !(n.allocation_gain > 0.0) {
            errors.push(ConfigError::new("node.allocation_gain", "must be > 0"));
        }
        for (field, value) in [
            ("node.send_offset_ms", n.send_offset_ms),
            ("node.send_interval_ms", n.send_interval_ms),
            ("node.initial_report_delay_ms", n.initial_report_delay_ms),
        ] {
            if value < 0 {
                errors.push(ConfigError::new(field, "must be >= 0"));
            }
        }

        let s = &self.simulation;
        if s.hours == 0 {
            errors.push(ConfigError::new("simulation.hours", "must be > 0"));
        }
        if s.tick_seconds == 0 {
            errors.push(ConfigError::new("simulation.tick_seconds", "must be > 0"));
        }
        if !s.request_watts.is_finite() {
            errors.push(ConfigError::new("simulation.request_watts", "must be finite"));
        }

        let mut ids = HashSet::new();
        let aggregator_ids: HashSet<&str> = self.aggregators.iter().map(|a| a.id.as_str()).collect();
        if self.aggregators.is_empty() {
            errors.push(ConfigError::new("aggregators", "at least one aggregator is required"));
        } else if self.root().is_none() {
            errors.push(ConfigError::new("aggregators", "exactly one aggregator must have no parent"));
        }
        for (i, agg) in self.aggregators.iter().enumerate() {
            if agg.id.is_empty() {
                errors.push(ConfigError::new(format!("aggregators[{i}].id"), "must not be empty"));
            } else if !ids.insert(agg.id.as_str()) {
                errors.push(ConfigError::new(
                    format!("aggregators[{i}].id"),
                    format!("duplicate id \"{}\"", agg.id),
                ));
            }
            if let Some(parent) = &agg.parent {
                if parent == &agg.id {
                    errors.push(ConfigError::new(format!("aggregators[{i}].parent"), "must not be itself"));
                } else if !aggregator_ids.contains(parent.as_str()) {
                    errors.push(ConfigError::new(
                        format!("aggregators[{i}].parent"),
                        format!("unknown aggregator \"{parent}\""),
                    ));
                }
            }
        }

        for (i, leaf) in self.leaves.iter().enumerate() {
            let field = |name: &str| format!("leaves[{i}].{name}");
            if leaf.id.is_empty() {
                errors.push(ConfigError::new(field("id"), "must not be empty"));
            } else if !ids.insert(leaf.id.as_str()) {
                errors.push(ConfigError::new(field("id"), format!("duplicate id \"{}\"", leaf.id)));
            }
            if !aggregator_ids.contains(leaf.parent.as_str()) {
                errors.push(ConfigError::new(
                    field("parent"),
                    format!("unknown aggregator \"{}\"", leaf.parent),
                ));
            }
            if leaf.category == Category::All {
                errors.push(ConfigError::new(field("category"), "ALL is derived and cannot be reported"));
            }
            if !(leaf.max_consumption > 0.0) {
                errors.push(ConfigError::new(field("max_consumption"), "must be > 0"));
            }
            if !(0.0..=100.0).contains(&leaf.min_flex)
                || !(0.0..=100.0).contains(&leaf.max_flex)
                || leaf.min_flex > leaf.max_flex
            {
                errors.push(ConfigError::new(
                    field("min_flex"),
                    "min_flex and max_flex must satisfy 0 <= min_flex <= max_flex <= 100",
                ));
            }
            if leaf.forecast_horizon_hours == 0 {
                errors.push(ConfigError::new(field("forecast_horizon_hours"), "must be > 0"));
            }
            if leaf.timespread.is_empty() {
                errors.push(ConfigError::new(field("timespread"), "must not be empty"));
            }
            if leaf
                .timespread
                .windows(2)
                .any(|w| w[0].seconds_of_day >= w[1].seconds_of_day)
            {
                errors.push(ConfigError::new(
                    field("timespread"),
                    "must be strictly increasing in seconds_of_day",
                ));
            }
            if leaf
                .timespread
                .iter()
                .any(|s| s.seconds_of_day >= 86_400 || !(0.0..=100.0).contains(&s.usage_percentage))
            {
                errors.push(ConfigError::new(
                    field("timespread"),
                    "seconds_of_day must be < 86400 and usage_percentage in [0, 100]",
                ));
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        for name in TreeConfig::PRESETS {
            let cfg = TreeConfig::from_preset(name).expect("preset exists");
            let errors = cfg.validate();
            assert!(errors.is_empty(), "{name} should be valid: {errors:?}");
        }
    }

    #[test]
    fn from_preset_unknown() {
        let err = TreeConfig::from_preset("nonexistent").expect_err("unknown preset");
        assert!(err.message.contains("unknown preset"));
        assert!(err.message.contains("single_bus"));
    }

    #[test]
    fn node_defaults() {
        let node = NodeConfig::default();
        assert_eq!(node.timeslot(), Duration::minutes(15));
        assert_eq!(node.steer_limit_watts, 100.0);
        assert_eq!(node.allocation_gain, 2.0);
        assert!(!node.skip_reports);
    }

    #[test]
    fn valid_toml_parses() {
        let toml = r#"
[node]
timeslot_minutes = 15
steer_limit_watts = 50.0
send_offset_ms = 5000

[simulation]
start = "2016-03-01T06:00:00Z"
hours = 4
tick_seconds = 30
seed = 7
request_watts = 250.0
request_at_minutes = 10

[[aggregators]]
id = "bus_main"

[[aggregators]]
id = "street"
parent = "bus_main"

[[leaves]]
id = "boiler"
parent = "street"
category = "HVAC"
max_consumption = 2500.0
max_flex = 90.0
min_flex = 10.0
timespread = [
    { seconds_of_day = 0, usage_percentage = 20.0 },
    { seconds_of_day = 43200, usage_percentage = 60.0 },
]
"#;
        let cfg = TreeConfig::from_toml_str(toml).expect("valid TOML should parse");
        assert_eq!(cfg.node.steer_limit_watts, 50.0);
        assert_eq!(cfg.node.allocation_gain, 2.0);
        assert_eq!(cfg.simulation.hours, 4);
        assert_eq!(cfg.simulation.start.to_rfc3339(), "2016-03-01T06:00:00+00:00");
        assert_eq!(cfg.root(), Some("bus_main"));
        assert_eq!(cfg.leaves[0].category, Category::Hvac);
        assert_eq!(cfg.leaves[0].forecast_horizon_hours, 13);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn invalid_toml_unknown_field() {
        let toml = r#"
[node]
timeslot_minutes = 15
bogus_field = true
"#;
        assert!(TreeConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn validation_catches_zero_timeslot() {
        let mut cfg = TreeConfig::single_bus();
        cfg.node.timeslot_minutes = 0;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "node.timeslot_minutes"));
    }

    #[test]
    fn validation_catches_missing_root() {
        let mut cfg = TreeConfig::two_level();
        cfg.aggregators[0].parent = Some("feeder_a".to_string());
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "aggregators"));
    }

    #[test]
    fn validation_catches_orphan_leaf_and_duplicates() {
        let mut cfg = TreeConfig::single_bus();
        cfg.leaves[0].parent = "nowhere".to_string();
        cfg.leaves[2].id = cfg.leaves[1].id.clone();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "leaves[0].parent"));
        assert!(errors.iter().any(|e| e.field == "leaves[2].id"));
    }

    #[test]
    fn validation_catches_inverted_flex_band() {
        let mut cfg = TreeConfig::single_bus();
        cfg.leaves[1].min_flex = 80.0;
        cfg.leaves[1].max_flex = 20.0;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "leaves[1].min_flex"));
    }

    #[test]
    fn validation_catches_unsorted_timespread() {
        let mut cfg = TreeConfig::single_bus();
        cfg.leaves[0].timespread.reverse();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "leaves[0].timespread"));
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::new("node.allocation_gain", "must be > 0");
        assert_eq!(err.to_string(), "config error: node.allocation_gain: must be > 0");
    }
}
