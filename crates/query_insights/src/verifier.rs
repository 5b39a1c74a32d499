use std::collections::HashSet;
use std::convert::Infallible;
use std::ops::ControlFlow;

use sqlparser::ast::{
    Expr, ObjectName, ObjectNamePart, Query, SelectItem, SetExpr, Statement, TableFactor, Visit,
    Visitor,
};

use crate::config::SqlDialect;
use crate::quoting::{needs_quoting, quote_ident};
use crate::{parse_statements, InsightError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotingFinding {
    pub identifier: String,
    pub requires_quoting: bool,
    pub is_quoted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuotingReport {
    pub findings: Vec<QuotingFinding>,
    pub score: f64,
}

/// The check is textual: `"name"` appearing anywhere in `sql`, string
/// literals included, counts as quoted.
pub fn verify(sql: &str, statements: &[Statement]) -> Vec<QuotingFinding> {
    extract_identifiers(statements)
        .into_iter()
        .map(|identifier| {
            let requires_quoting = needs_quoting(&identifier);
            let is_quoted = requires_quoting && sql.contains(&quote_ident(&identifier));
            QuotingFinding {
                identifier,
                requires_quoting,
                is_quoted,
            }
        })
        .collect()
}

pub fn quoting_score(findings: &[QuotingFinding]) -> f64 {
    let required = findings.iter().filter(|f| f.requires_quoting).count();
    if required == 0 {
        return 1.0;
    }
    let quoted = findings
        .iter()
        .filter(|f| f.requires_quoting && f.is_quoted)
        .count();
    quoted as f64 / required as f64
}

pub fn score_quoting(sql: &str, dialect: SqlDialect) -> Result<QuotingReport, InsightError> {
    let statements = parse_statements(sql, dialect)?;
    let findings = verify(sql, &statements);
    let score = quoting_score(&findings);
    Ok(QuotingReport { findings, score })
}

pub fn extract_identifiers(statements: &[Statement]) -> Vec<String> {
    let mut collector = IdentifierCollector::default();
    for statement in statements {
        match statement.visit(&mut collector) {
            ControlFlow::Continue(()) => {}
            ControlFlow::Break(never) => match never {},
        }
    }
    collector.names
}

#[derive(Default)]
struct IdentifierCollector {
    names: Vec<String>,
    seen: HashSet<String>,
}

impl IdentifierCollector {
    fn push(&mut self, name: &str) {
        if self.seen.insert(name.to_string()) {
            self.names.push(name.to_string());
        }
    }

    fn push_object_name(&mut self, name: &ObjectName) {
        for ident in name.0.iter().filter_map(ObjectNamePart::as_ident) {
            self.push(&ident.value);
        }
    }

    fn push_projection_aliases(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for item in &select.projection {
                    if let SelectItem::ExprWithAlias { alias, .. } = item {
                        self.push(&alias.value);
                    }
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.push_projection_aliases(left);
                self.push_projection_aliases(right);
            }
            // Nested queries are visited on their own.
            _ => {}
        }
    }
}

impl Visitor for IdentifierCollector {
    type Break = Infallible;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.push(&cte.alias.name.value);
            }
        }
        self.push_projection_aliases(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        self.push_object_name(relation);
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        let alias = match table_factor {
            TableFactor::Table { alias, .. } | TableFactor::Derived { alias, .. } => alias.as_ref(),
            _ => None,
        };
        if let Some(alias) = alias {
            self.push(&alias.name.value);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.push(&ident.value),
            Expr::CompoundIdentifier(idents) => {
                for ident in idents {
                    self.push(&ident.value);
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}
