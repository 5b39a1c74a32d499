use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use sqlparser::dialect::{Dialect, GenericDialect, PostgreSqlDialect};

use crate::advisor::AdvisorCacheConfig;
use crate::classifier::{Classifier, DEFAULT_SLOW_QUERY_THRESHOLD_MS};
use crate::InsightError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[default]
    Postgres,
    Generic,
}

impl SqlDialect {
    pub fn dialect(self) -> Box<dyn Dialect> {
        match self {
            SqlDialect::Postgres => Box::new(PostgreSqlDialect {}),
            SqlDialect::Generic => Box::new(GenericDialect {}),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdvisorSettings {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for AdvisorSettings {
    fn default() -> Self {
        let cache = AdvisorCacheConfig::default();
        Self {
            enabled: true,
            ttl_secs: cache.ttl.as_secs(),
            max_entries: cache.max_entries,
        }
    }
}

impl AdvisorSettings {
    pub fn cache_config(&self) -> AdvisorCacheConfig {
        AdvisorCacheConfig {
            ttl: Duration::from_secs(self.ttl_secs),
            max_entries: self.max_entries,
        }
    }
}

/// Settings read from an optional TOML file; every field has a default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct InsightsConfig {
    pub slow_query_threshold_ms: f64,
    pub dialect: SqlDialect,
    pub advisor: AdvisorSettings,
}

impl Default for InsightsConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: DEFAULT_SLOW_QUERY_THRESHOLD_MS,
            dialect: SqlDialect::default(),
            advisor: AdvisorSettings::default(),
        }
    }
}

impl InsightsConfig {
    pub fn from_toml(contents: &str) -> Result<Self, InsightError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| InsightError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, InsightError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            InsightError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    pub fn classifier(&self) -> Classifier {
        Classifier::new(self.slow_query_threshold_ms)
    }

    fn validate(&self) -> Result<(), InsightError> {
        if !self.slow_query_threshold_ms.is_finite() || self.slow_query_threshold_ms < 0.0 {
            return Err(InsightError::Config(format!(
                "slow_query_threshold_ms must be a non-negative number, got {}",
                self.slow_query_threshold_ms
            )));
        }
        if self.advisor.max_entries == 0 {
            return Err(InsightError::Config(
                "advisor.max_entries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
