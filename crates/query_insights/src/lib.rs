//! Query health diagnosis from runtime statistics, and identifier-quoting and
//! syntax checks for generated SQL.

use sqlparser::ast::Statement;
use sqlparser::parser::Parser;
use thiserror::Error;

pub mod advisor;
pub mod classifier;
pub mod config;
pub mod quoting;
pub mod stats;
pub mod suggest;
pub mod syntax;
pub mod verifier;

pub use advisor::{
    enrich, is_eligible, AdvisorCache, AdvisorCacheConfig, AdvisorFetcher, FetchError,
};
pub use classifier::{
    classify, triage, Classification, Classifier, Insight, IssueKind, IssueSummary,
};
pub use config::{InsightsConfig, SqlDialect};
pub use quoting::{needs_quoting, quote_ident};
pub use stats::{load_rows, AdvisorResult, IndexCost, StatRow};
pub use suggest::{suggest_indexes, IndexSuggestion, LocalAdvisor};
pub use syntax::{validate_batch, SyntaxReport};
pub use verifier::{quoting_score, score_quoting, verify, QuotingFinding, QuotingReport};

#[derive(Debug, Error)]
pub enum InsightError {
    #[error("failed to parse SQL: {0}")]
    Parse(String),
    #[error("unsupported query shape: {0}")]
    Unsupported(String),
    #[error("malformed statistics row: {0}")]
    MalformedRow(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Parse SQL text into statements, or the parser's syntax error.
pub fn parse_statements(sql: &str, dialect: SqlDialect) -> Result<Vec<Statement>, InsightError> {
    Parser::parse_sql(dialect.dialect().as_ref(), sql)
        .map_err(|e| InsightError::Parse(e.to_string()))
}

pub(crate) fn parse_single_statement(
    sql: &str,
    dialect: SqlDialect,
) -> Result<Statement, InsightError> {
    let mut statements = parse_statements(sql, dialect)?;
    if statements.len() != 1 {
        return Err(InsightError::Unsupported(
            "expected exactly one statement".to_string(),
        ));
    }
    Ok(statements.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_statements_reports_parser_message() {
        let err = parse_statements("select * fro t", SqlDialect::Postgres).unwrap_err();
        let InsightError::Parse(message) = err else {
            panic!("expected a parse error");
        };
        assert!(message.contains("fro"), "{message}");
    }

    #[test]
    fn parse_statements_accepts_multiple_statements() {
        let statements = parse_statements("select 1; select 2", SqlDialect::Generic).unwrap();
        assert_eq!(statements.len(), 2);
    }

    #[test]
    fn parse_single_statement_rejects_batches() {
        let err = parse_single_statement("select 1; select 2", SqlDialect::Postgres).unwrap_err();
        assert!(matches!(err, InsightError::Unsupported(_)));
    }
}
