use serde::Deserialize;

use crate::InsightError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct IndexCost {
    #[serde(default)]
    pub startup_cost_before: f64,
    #[serde(default)]
    pub startup_cost_after: f64,
    #[serde(default)]
    pub total_cost_before: f64,
    #[serde(default)]
    pub total_cost_after: f64,
}

/// Outcome of one index-advisor analysis for a query text.
///
/// A non-empty `errors` list means the analysis itself failed, whatever
/// `index_statements` holds. Empty `errors` with at least one statement is a
/// recommendation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AdvisorResult {
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub index_statements: Vec<String>,
    #[serde(default)]
    pub cost: IndexCost,
}

impl AdvisorResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
            ..Self::default()
        }
    }

    pub fn recommending(index_statements: Vec<String>) -> Self {
        Self {
            index_statements,
            ..Self::default()
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_recommendation(&self) -> bool {
        self.errors.is_empty() && !self.index_statements.is_empty()
    }
}

/// One row of runtime query statistics. Times are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatRow {
    pub query: String,
    #[serde(default)]
    pub calls: u64,
    #[serde(default)]
    pub mean_time: f64,
    #[serde(default)]
    pub min_time: f64,
    #[serde(default)]
    pub max_time: f64,
    #[serde(default)]
    pub total_time: f64,
    #[serde(default)]
    pub rows_read: u64,
    #[serde(default)]
    pub cache_hit_rate: Option<f64>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub application_name: Option<String>,
    #[serde(default)]
    pub advisor_result: Option<AdvisorResult>,
    #[serde(default)]
    pub total_cache_hits: u64,
    #[serde(default)]
    pub total_cache_misses: u64,
}

impl StatRow {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn cache_hit_ratio(&self) -> Option<f64> {
        if let Some(rate) = self.cache_hit_rate {
            return Some(rate);
        }
        let total = self.total_cache_hits + self.total_cache_misses;
        if total == 0 {
            return None;
        }
        Some(self.total_cache_hits as f64 / total as f64)
    }
}

/// Deserialize a JSON array of statistics rows, rejecting rows without query text.
pub fn load_rows(json: &str) -> Result<Vec<StatRow>, InsightError> {
    let rows: Vec<StatRow> = serde_json::from_str(json)
        .map_err(|e| InsightError::MalformedRow(format!("invalid statistics payload: {e}")))?;
    for (index, row) in rows.iter().enumerate() {
        if row.query.trim().is_empty() {
            return Err(InsightError::MalformedRow(format!(
                "row {index} has no query text"
            )));
        }
    }
    Ok(rows)
}
