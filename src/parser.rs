//! Query analysis: turns SQL text into a [`ParsedQuery`] and classifies it
//! into a [`QueryShape`] once per request.
//!
//! Everything downstream (partitioning, merging, HAVING) reads the shape and
//! never re-parses the SQL text.

use std::ops::ControlFlow;

use serde::Serialize;
use sqlparser::ast::{
    visit_expressions, BinaryOperator, Expr, Function, GroupByExpr, Ident, Select, SelectItem,
    SetExpr, Statement, TableFactor, UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::error::{DispatchError, Result};
use crate::having::Expression;

/// Name a database gives a projection it cannot derive a name for.
pub const ANONYMOUS_COLUMN: &str = "?column?";

/// An immutable parsed statement together with the text it came from.
///
/// Rewrites never touch this value; they clone the tree first.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    text: String,
    statement: Statement,
}

impl ParsedQuery {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    /// The top-level SELECT, if the statement is a plain query.
    pub fn select(&self) -> Option<&Select> {
        match &self.statement {
            Statement::Query(query) => match query.body.as_ref() {
                SetExpr::Select(select) => Some(select),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggKind {
    pub fn from_function_name(name: &str) -> Option<AggKind> {
        match name.to_uppercase().as_str() {
            "COUNT" => Some(AggKind::Count),
            "SUM" => Some(AggKind::Sum),
            "AVG" => Some(AggKind::Avg),
            "MIN" => Some(AggKind::Min),
            "MAX" => Some(AggKind::Max),
            _ => None,
        }
    }

    /// Resolve a function call to an aggregate kind by its last name part.
    pub fn of_function(func: &Function) -> Option<AggKind> {
        func.name
            .0
            .last()
            .and_then(|ident| AggKind::from_function_name(&ident.value))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggKind::Count => "count",
            AggKind::Sum => "sum",
            AggKind::Avg => "avg",
            AggKind::Min => "min",
            AggKind::Max => "max",
        }
    }
}

/// A partition range written explicitly in the WHERE clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExplicitRange {
    pub column: String,
    pub low: i64,
    pub high: i64,
}

/// Everything the pipeline needs to know about a query.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct QueryShape {
    pub is_aggregate: bool,
    pub agg_type: Option<AggKind>,
    pub agg_column: Option<String>,
    pub agg_alias: Option<String>,
    pub group_by_keys: Vec<String>,
    pub having_predicate: Option<Expression>,
    pub table_name: Option<String>,
    /// First column referenced by a WHERE comparison, if any.
    pub partition_column: Option<String>,
    pub explicit_range: Option<ExplicitRange>,
}

impl QueryShape {
    pub fn is_grouped(&self) -> bool {
        !self.group_by_keys.is_empty()
    }
}

/// Parse exactly one SQL statement.
pub fn parse(sql: &str) -> Result<ParsedQuery> {
    let dialect = GenericDialect {};
    let mut statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| DispatchError::Parse(e.to_string()))?;

    match statements.len() {
        1 => Ok(ParsedQuery {
            text: sql.trim().trim_end_matches(';').trim_end().to_string(),
            statement: statements.remove(0),
        }),
        0 => Err(DispatchError::Parse("empty SQL statement".to_string())),
        n => Err(DispatchError::Parse(format!(
            "expected a single statement, found {}",
            n
        ))),
    }
}

/// Classify a parsed statement. Non-SELECT statements yield an empty shape
/// (no table, never split).
pub fn classify(parsed: &ParsedQuery) -> Result<QueryShape> {
    let select = match parsed.select() {
        Some(select) => select,
        None => return Ok(QueryShape::default()),
    };

    let mut shape = QueryShape::default();

    if let Some((kind, column, alias)) = detect_aggregate(select) {
        shape.is_aggregate = true;
        shape.agg_type = Some(kind);
        shape.agg_column = column;
        shape.agg_alias = Some(alias);
    }

    shape.group_by_keys = group_by_keys(select);

    if let Some(having) = &select.having {
        shape.having_predicate = Some(Expression::from_sql(having)?);
    }

    shape.table_name = first_table(select);

    if let Some(selection) = &select.selection {
        let (column, range) = detect_range(selection);
        shape.partition_column = column;
        shape.explicit_range = range;
    }

    Ok(shape)
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// The first projection containing an aggregate call decides the kind.
/// Returns (kind, first column inside the call, alias or display name).
fn detect_aggregate(select: &Select) -> Option<(AggKind, Option<String>, String)> {
    for item in &select.projection {
        let (expr, alias) = match item {
            SelectItem::UnnamedExpr(expr) => (expr, None),
            SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias)),
            _ => continue,
        };

        let found = visit_expressions(expr, |e| match e {
            Expr::Function(func) => match AggKind::of_function(func) {
                Some(kind) => ControlFlow::Break((kind, func.clone())),
                None => ControlFlow::Continue(()),
            },
            _ => ControlFlow::Continue(()),
        });

        if let ControlFlow::Break((kind, func)) = found {
            let column = first_column(&func);
            let name = match alias {
                Some(alias) => normalized_ident(alias),
                None => display_name(expr),
            };
            return Some((kind, column, name));
        }
    }
    None
}

/// First column referenced inside a function call; `None` for `COUNT(*)`.
fn first_column(func: &Function) -> Option<String> {
    match visit_expressions(func, |e| match column_name(e) {
        Some(name) => ControlFlow::Break(name.to_string()),
        None => ControlFlow::Continue(()),
    }) {
        ControlFlow::Break(name) => Some(name),
        ControlFlow::Continue(()) => None,
    }
}

// ---------------------------------------------------------------------------
// GROUP BY
// ---------------------------------------------------------------------------

fn group_by_keys(select: &Select) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    let mut push = |key: String| {
        if !keys.contains(&key) {
            keys.push(key);
        }
    };

    match &select.group_by {
        GroupByExpr::Expressions(exprs, _) => {
            for expr in exprs {
                if let Some(key) = group_key_name(select, expr) {
                    push(key);
                }
            }
        }
        // GROUP BY ALL groups by every non-aggregate projection.
        GroupByExpr::All(_) => {
            for item in &select.projection {
                let is_aggregate = match item {
                    SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                        contains_aggregate(expr)
                    }
                    _ => true,
                };
                if !is_aggregate {
                    if let Some(name) = projection_name(item) {
                        push(name);
                    }
                }
            }
        }
    }

    keys
}

fn group_key_name(select: &Select, expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => Some(display_name(expr)),
        // Positional reference: GROUP BY 1
        Expr::Value(SqlValue::Number(n, _)) => n
            .parse::<usize>()
            .ok()
            .and_then(|pos| pos.checked_sub(1))
            .and_then(|idx| select.projection.get(idx))
            .and_then(projection_name),
        Expr::Value(_) => Some(display_name(expr)),
        derived => {
            let aliased = select.projection.iter().find_map(|item| match item {
                SelectItem::ExprWithAlias { expr, alias } if expr == derived => {
                    Some(normalized_ident(alias))
                }
                _ => None,
            });
            Some(aliased.unwrap_or_else(|| display_name(derived)))
        }
    }
}

fn projection_name(item: &SelectItem) -> Option<String> {
    match item {
        SelectItem::UnnamedExpr(expr) => Some(display_name(expr)),
        SelectItem::ExprWithAlias { alias, .. } => Some(normalized_ident(alias)),
        _ => None,
    }
}

fn contains_aggregate(expr: &Expr) -> bool {
    visit_expressions(expr, |e| match e {
        Expr::Function(func) if AggKind::of_function(func).is_some() => ControlFlow::Break(()),
        _ => ControlFlow::Continue(()),
    })
    .is_break()
}

// ---------------------------------------------------------------------------
// FROM / WHERE
// ---------------------------------------------------------------------------

fn first_table(select: &Select) -> Option<String> {
    match &select.from.first()?.relation {
        TableFactor::Table { name, .. } => Some(
            name.0
                .iter()
                .map(|ident| ident.value.clone())
                .collect::<Vec<_>>()
                .join("."),
        ),
        _ => None,
    }
}

/// Best-effort range detection.
///
/// When WHERE contains a comparison or BETWEEN, the first column referenced
/// anywhere in WHERE is the partition column, and the first two integer
/// literals anywhere in WHERE (in encounter order) are its bounds. Unrelated
/// numeric predicates can therefore be mistaken for the range.
fn detect_range(selection: &Expr) -> (Option<String>, Option<ExplicitRange>) {
    let mut has_range_node = false;
    let mut column: Option<String> = None;
    let mut literals: Vec<i64> = Vec::new();
    // Set after a negated literal; pre-order visits its operand next.
    let mut skip_operand = false;

    let _ = visit_expressions(selection, |expr| {
        if std::mem::take(&mut skip_operand) {
            return ControlFlow::<()>::Continue(());
        }
        match expr {
            Expr::Between { .. } => has_range_node = true,
            Expr::BinaryOp { op, .. } if is_comparison(op) => has_range_node = true,
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
                if column.is_none() {
                    column = column_name(expr).map(str::to_string);
                }
            }
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr: inner,
            } => {
                if let Expr::Value(SqlValue::Number(n, _)) = inner.as_ref() {
                    if let Ok(v) = format!("-{}", n).parse::<i64>() {
                        literals.push(v);
                    }
                    skip_operand = true;
                }
            }
            Expr::Value(SqlValue::Number(n, _)) => {
                if let Ok(v) = n.parse::<i64>() {
                    literals.push(v);
                }
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });

    if !has_range_node {
        return (None, None);
    }

    let range = match (&column, literals.as_slice()) {
        (Some(col), [low, high, ..]) => Some(ExplicitRange {
            column: col.clone(),
            low: *low,
            high: *high,
        }),
        _ => None,
    };
    (column, range)
}

pub(crate) fn is_comparison(op: &BinaryOperator) -> bool {
    matches!(
        op,
        BinaryOperator::Gt
            | BinaryOperator::Lt
            | BinaryOperator::GtEq
            | BinaryOperator::LtEq
            | BinaryOperator::Eq
            | BinaryOperator::NotEq
    )
}

// ---------------------------------------------------------------------------
// Naming helpers
// ---------------------------------------------------------------------------

/// Plain column name of a column reference (last part of a compound name).
pub(crate) fn column_name(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.as_str()),
        Expr::CompoundIdentifier(idents) => idents.last().map(|i| i.value.as_str()),
        _ => None,
    }
}

/// Unquoted identifiers fold to lower case, as the workers' database does.
fn normalized_ident(ident: &Ident) -> String {
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_lowercase()
    }
}

/// Column name the database assigns to an unaliased projection.
pub fn display_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => normalized_ident(ident),
        Expr::CompoundIdentifier(idents) => idents
            .last()
            .map(normalized_ident)
            .unwrap_or_else(|| ANONYMOUS_COLUMN.to_string()),
        Expr::Function(func) => func
            .name
            .0
            .last()
            .map(|ident| ident.value.to_lowercase())
            .unwrap_or_else(|| ANONYMOUS_COLUMN.to_string()),
        Expr::Nested(inner) => display_name(inner),
        Expr::Cast { expr, .. } => display_name(expr),
        _ => ANONYMOUS_COLUMN.to_string(),
    }
}
