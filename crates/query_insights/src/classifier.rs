use std::cmp::Ordering;
use std::fmt;

use crate::stats::StatRow;

pub const DEFAULT_SLOW_QUERY_THRESHOLD_MS: f64 = 300.0;

pub const MISSING_INDEX_HINT: &str = "Missing index: an index would reduce this query's cost";
pub const SLOW_QUERY_HINT: &str = "Abnormally slow query detected";
pub const ADVISOR_FAILURE_HINT: &str = "Index advisor analysis failed";

// Declared from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IssueKind {
    Error,
    MissingIndex,
    Slow,
    None,
}

impl IssueKind {
    pub fn label(self) -> &'static str {
        match self {
            IssueKind::Error => "ERROR",
            IssueKind::MissingIndex => "MISSING_INDEX",
            IssueKind::Slow => "SLOW",
            IssueKind::None => "OK",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// `hint` is empty exactly when `kind` is [`IssueKind::None`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: IssueKind,
    pub hint: String,
}

impl Classification {
    fn new(kind: IssueKind, hint: impl Into<String>) -> Self {
        Self {
            kind,
            hint: hint.into(),
        }
    }

    fn none() -> Self {
        Self::new(IssueKind::None, "")
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classifier {
    /// Rows whose mean time is strictly above this are slow.
    pub slow_query_threshold_ms: f64,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: DEFAULT_SLOW_QUERY_THRESHOLD_MS,
        }
    }
}

impl Classifier {
    pub fn new(slow_query_threshold_ms: f64) -> Self {
        Self {
            slow_query_threshold_ms,
        }
    }

    /// First match wins: advisor errors, then index recommendations, then
    /// latency. A row that has not been analyzed only reaches the latency check.
    pub fn classify(&self, row: &StatRow) -> Classification {
        if let Some(advisor) = row.advisor_result.as_ref() {
            if let Some(first) = advisor.errors.first() {
                let hint = if first.trim().is_empty() {
                    ADVISOR_FAILURE_HINT
                } else {
                    first.as_str()
                };
                return Classification::new(IssueKind::Error, hint);
            }
            if !advisor.index_statements.is_empty() {
                return Classification::new(IssueKind::MissingIndex, MISSING_INDEX_HINT);
            }
        }

        if row.mean_time > self.slow_query_threshold_ms {
            return Classification::new(IssueKind::Slow, SLOW_QUERY_HINT);
        }

        Classification::none()
    }
}

pub fn classify(row: &StatRow) -> Classification {
    Classifier::default().classify(row)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insight {
    pub row: StatRow,
    pub classification: Classification,
}

/// Classify every row and order the result most severe first, heaviest total
/// time first within a kind. Equal keys keep their input order.
pub fn triage(rows: Vec<StatRow>, classifier: &Classifier) -> Vec<Insight> {
    let mut insights = rows
        .into_iter()
        .map(|row| Insight {
            classification: classifier.classify(&row),
            row,
        })
        .collect::<Vec<_>>();
    insights.sort_by(|a, b| {
        a.classification
            .kind
            .cmp(&b.classification.kind)
            .then_with(|| descending_time(a.row.total_time, b.row.total_time))
    });
    insights
}

fn descending_time(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IssueSummary {
    pub errors: usize,
    pub missing_indexes: usize,
    pub slow: usize,
    pub healthy: usize,
}

impl IssueSummary {
    pub fn from_insights(insights: &[Insight]) -> Self {
        let mut summary = Self::default();
        for insight in insights {
            match insight.classification.kind {
                IssueKind::Error => summary.errors += 1,
                IssueKind::MissingIndex => summary.missing_indexes += 1,
                IssueKind::Slow => summary.slow += 1,
                IssueKind::None => summary.healthy += 1,
            }
        }
        summary
    }

    pub fn problems(&self) -> usize {
        self.errors + self.missing_indexes + self.slow
    }
}
