use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, FunctionArguments, JoinConstraint, JoinOperator, ObjectName,
    Select, SetExpr, Statement, TableAlias, TableFactor,
};

use crate::advisor::{AdvisorFetcher, FetchError};
use crate::config::SqlDialect;
use crate::quoting::{needs_quoting, quote_ident};
use crate::stats::AdvisorResult;
use crate::{parse_single_statement, InsightError};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexSuggestion {
    pub table: String,
    pub column: String,
    pub statement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ColumnRef {
    qualifier: Option<String>,
    column: String,
}

/// Propose one single-column index per column filtered in WHERE or joined on
/// in JOIN ... ON of a single SELECT.
///
/// Unqualified columns are only attributed when the query reads one table.
pub fn suggest_indexes(
    query: &str,
    dialect: SqlDialect,
) -> Result<Vec<IndexSuggestion>, InsightError> {
    let statement = parse_single_statement(query, dialect)?;
    let select = match statement {
        Statement::Query(query) => match *query.body {
            SetExpr::Select(select) => select,
            _ => {
                return Err(InsightError::Unsupported(
                    "only plain SELECT queries are analyzed".to_string(),
                ));
            }
        },
        _ => {
            return Err(InsightError::Unsupported(
                "only queries are analyzed".to_string(),
            ));
        }
    };

    let alias_to_table = build_alias_to_table(&select);
    let base_table = if select.from.len() == 1 && select.from[0].joins.is_empty() {
        table_factor_name(&select.from[0].relation)
    } else {
        None
    };

    let mut refs = Vec::new();
    if let Some(selection) = select.selection.as_ref() {
        collect_column_refs(selection, &mut refs);
    }
    for table_with_joins in &select.from {
        for join in &table_with_joins.joins {
            if let Some(JoinConstraint::On(expr)) = join_constraint(&join.join_operator) {
                collect_column_refs(expr, &mut refs);
            }
        }
    }

    let mut pairs = BTreeSet::<(String, String)>::new();
    for column_ref in refs {
        let table = match column_ref.qualifier.as_deref() {
            Some(qualifier) => match alias_to_table.get(qualifier) {
                Some(table) => table.clone(),
                None => vec![qualifier.to_string()],
            },
            None => match base_table.as_ref() {
                Some(table) => table.clone(),
                None => continue,
            },
        };
        pairs.insert((render_name(&table), column_ref.column));
    }

    Ok(pairs
        .into_iter()
        .map(|(table, column)| IndexSuggestion {
            statement: format!(
                "CREATE INDEX {} ON {}({});",
                format!("idx_{}_{}", ident_slug(&table), ident_slug(&column)),
                table,
                render_ident(&column),
            ),
            table,
            column,
        })
        .collect())
}

/// In-process stand-in for a remote index advisor. Costs are left at zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalAdvisor {
    dialect: SqlDialect,
}

impl LocalAdvisor {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }
}

#[async_trait]
impl AdvisorFetcher for LocalAdvisor {
    async fn fetch(&self, _context: &str, query: &str) -> Result<AdvisorResult, FetchError> {
        let result = match suggest_indexes(query, self.dialect) {
            Ok(suggestions) => AdvisorResult::recommending(
                suggestions
                    .into_iter()
                    .map(|suggestion| suggestion.statement)
                    .collect(),
            ),
            Err(InsightError::Unsupported(_)) => AdvisorResult::default(),
            Err(err) => AdvisorResult::failed(err.to_string()),
        };
        Ok(result)
    }
}

fn join_constraint(operator: &JoinOperator) -> Option<&JoinConstraint> {
    match operator {
        JoinOperator::Join(constraint)
        | JoinOperator::Inner(constraint)
        | JoinOperator::Left(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::Right(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint) => Some(constraint),
        _ => None,
    }
}

fn build_alias_to_table(select: &Select) -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    for table_with_joins in &select.from {
        let relations = std::iter::once(&table_with_joins.relation)
            .chain(table_with_joins.joins.iter().map(|join| &join.relation));
        for relation in relations {
            if let TableFactor::Table { name, alias, .. } = relation {
                map.insert(qualifier_for_table(name, alias), name_parts(name));
            }
        }
    }
    map
}

fn table_factor_name(table: &TableFactor) -> Option<Vec<String>> {
    match table {
        TableFactor::Table { name, .. } => Some(name_parts(name)),
        _ => None,
    }
}

fn name_parts(name: &ObjectName) -> Vec<String> {
    name.0
        .iter()
        .filter_map(|part| part.as_ident())
        .map(|ident| ident.value.clone())
        .collect()
}

fn qualifier_for_table(name: &ObjectName, alias: &Option<TableAlias>) -> String {
    match alias.as_ref() {
        Some(alias) => alias.name.value.clone(),
        None => name
            .0
            .last()
            .and_then(|part| part.as_ident())
            .map(|ident| ident.value.clone())
            .unwrap_or_else(|| name.to_string()),
    }
}

fn render_ident(value: &str) -> String {
    if needs_quoting(value) {
        quote_ident(value)
    } else {
        value.to_string()
    }
}

fn render_name(parts: &[String]) -> String {
    parts
        .iter()
        .map(|part| render_ident(part))
        .collect::<Vec<_>>()
        .join(".")
}

fn collect_column_refs(expr: &Expr, out: &mut Vec<ColumnRef>) {
    if let Some(column_ref) = column_ref(expr) {
        out.push(column_ref);
        return;
    }

    match expr {
        Expr::BinaryOp { left, right, .. } => {
            collect_column_refs(left, out);
            collect_column_refs(right, out);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::Cast { expr, .. } => collect_column_refs(expr, out),
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_column_refs(expr, out);
            collect_column_refs(low, out);
            collect_column_refs(high, out);
        }
        Expr::InList { expr, list, .. } => {
            collect_column_refs(expr, out);
            for item in list {
                collect_column_refs(item, out);
            }
        }
        Expr::Function(func) => {
            if let FunctionArguments::List(list) = &func.args {
                for arg in &list.args {
                    let arg = match arg {
                        FunctionArg::Unnamed(arg) | FunctionArg::Named { arg, .. } => arg,
                        FunctionArg::ExprNamed { name, arg, .. } => {
                            collect_column_refs(name, out);
                            arg
                        }
                    };
                    if let FunctionArgExpr::Expr(expr) = arg {
                        collect_column_refs(expr, out);
                    }
                }
            }
        }
        _ => {}
    }
}

fn column_ref(expr: &Expr) -> Option<ColumnRef> {
    match expr {
        Expr::Identifier(ident) => Some(ColumnRef {
            qualifier: None,
            column: ident.value.clone(),
        }),
        Expr::CompoundIdentifier(idents) if idents.len() >= 2 => Some(ColumnRef {
            qualifier: Some(idents[idents.len() - 2].value.clone()),
            column: idents.last()?.value.clone(),
        }),
        _ => None,
    }
}

fn ident_slug(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_us = false;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            prev_us = false;
            continue;
        }
        if !prev_us {
            out.push('_');
            prev_us = true;
        }
    }
    out.trim_matches('_').to_string()
}
