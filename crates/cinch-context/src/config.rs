//! Aggregate configuration for a [`ContextManager`](crate::manager::ContextManager).
//!
//! Every field has a documented default, so a config file only needs the
//! values it changes:
//!
//! ```json
//! {
//!   "budget": { "max_context_tokens": 200000 },
//!   "compaction": { "full_rounds_retention": 10 },
//!   "loader": { "cache_ttl": 120.0 }
//! }
//! ```
//!
//! Durations are written as seconds (fractional allowed).

use crate::budget::BudgetConfig;
use crate::compaction::CompactionConfig;
use crate::error::ConfigError;
use crate::loader::LoaderConfig;
use crate::relevance::ScorerConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration of all four engines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ContextConfig {
    pub budget: BudgetConfig,
    pub scorer: ScorerConfig,
    pub compaction: CompactionConfig,
    pub loader: LoaderConfig,
}

impl ContextConfig {
    pub fn with_budget(mut self, budget: BudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_scorer(mut self, scorer: ScorerConfig) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Check cross-field constraints of every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sections: [(&str, Result<(), String>); 4] = [
            ("budget", self.budget.validate()),
            ("scorer", self.scorer.validate()),
            ("compaction", self.compaction.validate()),
            ("loader", self.loader.validate()),
        ];
        for (name, result) in sections {
            result.map_err(|e| ConfigError::Invalid(format!("{name}: {e}")))?;
        }
        Ok(())
    }

    /// JSON Schema describing the config file.
    pub fn schema_json() -> serde_json::Value {
        let schema = schemars::schema_for!(ContextConfig);
        serde_json::to_value(schema)
            .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
    }
}

/// Serde helper: a [`Duration`](std::time::Duration) as a number of seconds.
pub(crate) mod duration_secs {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| D::Error::custom(format!("invalid duration {secs}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_json_gives_defaults() {
        let config = ContextConfig::from_json_str("{}").unwrap();
        assert_eq!(config, ContextConfig::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = ContextConfig::from_json_str(
            r#"{
                "budget": { "max_context_tokens": 200000 },
                "scorer": { "half_life": 60 },
                "loader": { "cache_ttl": 1.5, "max_concurrent_loads": 2 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.budget.max_context_tokens, 200_000);
        assert_eq!(config.budget.safety_margin, BudgetConfig::default().safety_margin);
        assert_eq!(config.scorer.half_life, Duration::from_secs(60));
        assert_eq!(config.loader.cache_ttl, Duration::from_millis(1500));
        assert_eq!(config.loader.max_concurrent_loads, 2);
        assert_eq!(config.compaction, CompactionConfig::default());
    }

    #[test]
    fn round_trips_through_json() {
        let config = ContextConfig::default()
            .with_compaction(CompactionConfig::default().with_retention(4));
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ContextConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = ContextConfig::from_json_str(r#"{"loader": {"chunk_size": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.starts_with("loader:")));

        let err = ContextConfig::from_json_str(r#"{"scorer": {"half_life": -1}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = ContextConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn reads_config_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.json");
        std::fs::write(&path, r#"{"compaction": {"max_rounds": 40}}"#).unwrap();
        assert_eq!(ContextConfig::from_file(&path).unwrap().compaction.max_rounds, 40);

        let err = ContextConfig::from_file(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn schema_lists_sections() {
        let schema = ContextConfig::schema_json();
        let properties = &schema["properties"];
        for section in ["budget", "scorer", "compaction", "loader"] {
            assert!(properties.get(section).is_some(), "missing {section}");
        }
    }
}
