// src/partitioner/mod.rs

// Query partitioning (Partitioner)
// Splits one statement into range-partitioned sub-queries over a numeric
// column. Every sub-query is rendered from its own copy of the parsed tree,
// and HAVING is stripped from all of them.

use std::sync::Arc;

use log::{debug, info};
use sqlparser::ast::{BinaryOperator, Expr, Ident, Query, Select, SetExpr, Statement, UnaryOperator, Value as SqlValue};

use crate::bounds::{is_plain_identifier, BoundsProvider};
use crate::parser::{column_name, is_comparison, ParsedQuery, QueryShape};
use crate::structs::{PartitionRange, SubQuery};

pub struct Partitioner {
    bounds: Arc<dyn BoundsProvider>,
    default_column: String,
}

impl Partitioner {
    pub fn new(bounds: Arc<dyn BoundsProvider>, default_column: impl Into<String>) -> Self {
        Partitioner {
            bounds,
            default_column: default_column.into(),
        }
    }

    /// A query can be split only when its FROM table is known.
    pub fn can_split(shape: &QueryShape) -> bool {
        shape.table_name.is_some()
    }

    /// Produce the ordered sub-queries for `parsed`.
    ///
    /// Falls back to a single, unsplit sub-query when the query cannot be
    /// split or its bounds are unknown. That fallback is not an error.
    pub async fn plan(&self, parsed: &ParsedQuery, shape: &QueryShape, parts: usize) -> Vec<SubQuery> {
        let table = match (&shape.table_name, parsed.select()) {
            (Some(table), Some(_)) => table,
            _ => return vec![unsplit(parsed)],
        };

        let (column, low, high) = match &shape.explicit_range {
            Some(range) => (range.column.clone(), range.low, range.high),
            None => {
                let column = shape
                    .partition_column
                    .clone()
                    .unwrap_or_else(|| self.default_column.clone());
                match self.bounds.bounds(table, &column).await {
                    Some((low, high)) => (column, low, high),
                    None => {
                        info!("No bounds for {}.{}; sending the query unsplit", table, column);
                        return vec![unsplit(parsed)];
                    }
                }
            }
        };

        if low > high {
            info!("Inverted range [{}, {}] on {}; sending the query unsplit", low, high, column);
            return vec![unsplit(parsed)];
        }

        let ranges = partition_ranges(low, high, parts);
        let empty = ranges.iter().filter(|r| r.is_empty()).count();
        debug!(
            "Partitioning {}.{} over [{}, {}] into {} part(s), {} empty",
            table, column, low, high, parts, empty
        );

        ranges
            .into_iter()
            .map(|range| match render_partition(parsed, shape, &column, range) {
                Some(sql) => SubQuery { sql, range: Some(range) },
                None => unsplit(parsed),
            })
            .collect()
    }
}

/// Split `[low, high]` into `parts` contiguous ranges whose union is exactly
/// `[low, high]`. The last range absorbs the remainder; when `parts`
/// exceeds the span, the leading ranges are empty (`start > end`).
pub fn partition_ranges(low: i64, high: i64, parts: usize) -> Vec<PartitionRange> {
    let n = parts.max(1) as i128;
    let (low, high) = (low as i128, high as i128);
    let step = (high - low + 1).div_euclid(n);

    (0..n)
        .map(|i| {
            let start = low + i * step;
            let end = if i < n - 1 { low + (i + 1) * step - 1 } else { high };
            PartitionRange {
                start: clamp_i64(start),
                end: clamp_i64(end),
            }
        })
        .collect()
}

fn clamp_i64(v: i128) -> i64 {
    v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// The original statement with HAVING removed. Statements without HAVING
/// are returned verbatim.
pub fn unsplit(parsed: &ParsedQuery) -> SubQuery {
    let sql = match (parsed.statement(), parsed.select()) {
        (Statement::Query(query), Some(select)) if select.having.is_some() => {
            let mut select = select.clone();
            select.having = None;
            render(query, select)
        }
        _ => parsed.text().to_string(),
    };
    SubQuery { sql, range: None }
}

fn render(query: &Query, select: Select) -> String {
    let mut query = query.clone();
    query.body = Box::new(SetExpr::Select(Box::new(select)));
    Statement::Query(Box::new(query)).to_string()
}

/// Render one partition: replace the detected range predicate with
/// `column BETWEEN start AND end`, keep every unrelated conjunct, drop HAVING.
fn render_partition(
    parsed: &ParsedQuery,
    shape: &QueryShape,
    column: &str,
    range: PartitionRange,
) -> Option<String> {
    let query = match parsed.statement() {
        Statement::Query(query) => query,
        _ => return None,
    };
    let mut select = parsed.select()?.clone();
    select.having = None;

    let mut conjuncts = Vec::new();
    if let Some(selection) = &select.selection {
        split_conjuncts(selection, &mut conjuncts);
    }
    if let Some(explicit) = &shape.explicit_range {
        let bounds = [explicit.low, explicit.high];
        conjuncts.retain(|c| !is_range_conjunct(c, column, &bounds));
    }

    let predicate = range_predicate(column, range);
    let mut kept = conjuncts.into_iter().map(parenthesize);
    select.selection = Some(match kept.next() {
        None => predicate,
        Some(first) => and(kept.fold(first, and), predicate),
    });

    Some(render(query, select))
}

fn split_conjuncts(expr: &Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            split_conjuncts(left, out);
            split_conjuncts(right, out);
        }
        Expr::Nested(inner) if matches!(inner.as_ref(), Expr::BinaryOp { op: BinaryOperator::And, .. }) => {
            split_conjuncts(inner, out)
        }
        other => out.push(other.clone()),
    }
}

/// A range bound on the partition column (`BETWEEN`, `<`, `<=`, `>`, `>=`)
/// whose literals all belong to the detected range.
fn is_range_conjunct(expr: &Expr, column: &str, bounds: &[i64; 2]) -> bool {
    let is_column = |e: &Expr| column_name(e).map_or(false, |c| c.eq_ignore_ascii_case(column));
    let is_bound = |e: &Expr| integer_literal(e).map_or(false, |v| bounds.contains(&v));

    match expr {
        Expr::Nested(inner) => is_range_conjunct(inner, column, bounds),
        Expr::Between {
            expr,
            negated: false,
            low,
            high,
        } => is_column(expr) && is_bound(low) && is_bound(high),
        Expr::BinaryOp { left, op, right }
            if is_comparison(op) && !matches!(op, BinaryOperator::Eq | BinaryOperator::NotEq) =>
        {
            (is_column(left) && is_bound(right)) || (is_bound(left) && is_column(right))
        }
        _ => false,
    }
}

fn integer_literal(expr: &Expr) -> Option<i64> {
    match expr {
        Expr::Value(SqlValue::Number(n, _)) => n.parse().ok(),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match expr.as_ref() {
            Expr::Value(SqlValue::Number(n, _)) => format!("-{}", n).parse().ok(),
            _ => None,
        },
        Expr::Nested(inner) => integer_literal(inner),
        _ => None,
    }
}

/// OR binds looser than AND, so a kept OR conjunct needs parentheses.
fn parenthesize(expr: Expr) -> Expr {
    match expr {
        Expr::BinaryOp {
            op: BinaryOperator::Or, ..
        } => Expr::Nested(Box::new(expr)),
        other => other,
    }
}

fn and(left: Expr, right: Expr) -> Expr {
    Expr::BinaryOp {
        left: Box::new(left),
        op: BinaryOperator::And,
        right: Box::new(right),
    }
}

fn range_predicate(column: &str, range: PartitionRange) -> Expr {
    let ident = if is_plain_identifier(column) {
        Ident::new(column)
    } else {
        Ident::with_quote('"', column)
    };
    Expr::Between {
        expr: Box::new(Expr::Identifier(ident)),
        negated: false,
        low: Box::new(Expr::Value(SqlValue::Number(range.start.to_string(), false))),
        high: Box::new(Expr::Value(SqlValue::Number(range.end.to_string(), false))),
    }
}
