//! Post-merge HAVING evaluation.
//!
//! HAVING is never sent to a worker. The predicate is captured once during
//! classification as an [`Expression`] and evaluated here against fully
//! merged rows.

use std::cmp::Ordering;

use log::debug;
use serde::Serialize;
use sqlparser::ast::{BinaryOperator, Expr, UnaryOperator, Value as SqlValue};
use thiserror::Error;

use crate::error::DispatchError;
use crate::parser::{column_name, AggKind};
use crate::structs::{Row, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompareOp {
    Gt,
    Lt,
    GtEq,
    LtEq,
    Eq,
    NotEq,
}

impl CompareOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::GtEq => ordering != Ordering::Less,
            CompareOp::LtEq => ordering != Ordering::Greater,
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::NotEq => ordering != Ordering::Equal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogicalOp {
    And,
    Or,
}

/// A HAVING predicate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expression {
    Literal {
        value: Value,
    },
    ColumnRef {
        name: String,
    },
    Comparison {
        op: CompareOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// An aggregate call written directly in HAVING, e.g. `COUNT(*) > 5`.
    AggregateRef {
        agg: AggKind,
    },
}

#[derive(Error, Debug, PartialEq)]
pub enum HavingError {
    #[error("cannot compare {left} with {right}")]
    Incomparable { left: String, right: String },

    #[error("operand of {op:?} is not a boolean: {value}")]
    NotBoolean { op: LogicalOp, value: String },
}

impl Expression {
    /// Convert a parsed HAVING clause. Only the node kinds of the closed
    /// `Expression` union are accepted; `BETWEEN` is desugared into two
    /// comparisons.
    pub fn from_sql(expr: &Expr) -> Result<Expression, DispatchError> {
        match expr {
            Expr::Nested(inner) => Expression::from_sql(inner),
            Expr::Value(value) => Ok(Expression::Literal {
                value: literal_value(value, false)?,
            }),
            Expr::UnaryOp { op, expr: inner } => match (op, inner.as_ref()) {
                (UnaryOperator::Minus, Expr::Value(value)) => Ok(Expression::Literal {
                    value: literal_value(value, true)?,
                }),
                (UnaryOperator::Plus, Expr::Value(value)) => Ok(Expression::Literal {
                    value: literal_value(value, false)?,
                }),
                _ => Err(unsupported(expr)),
            },
            Expr::Identifier(_) | Expr::CompoundIdentifier(_) => Ok(Expression::ColumnRef {
                name: column_name(expr).unwrap_or_default().to_string(),
            }),
            Expr::Function(func) => match AggKind::of_function(func) {
                Some(agg) => Ok(Expression::AggregateRef { agg }),
                None => Err(unsupported(expr)),
            },
            Expr::BinaryOp { left, op, right } => {
                let left = Box::new(Expression::from_sql(left)?);
                let right = Box::new(Expression::from_sql(right)?);
                let compare = match op {
                    BinaryOperator::Gt => CompareOp::Gt,
                    BinaryOperator::Lt => CompareOp::Lt,
                    BinaryOperator::GtEq => CompareOp::GtEq,
                    BinaryOperator::LtEq => CompareOp::LtEq,
                    BinaryOperator::Eq => CompareOp::Eq,
                    BinaryOperator::NotEq => CompareOp::NotEq,
                    BinaryOperator::And => {
                        return Ok(Expression::Logical { op: LogicalOp::And, left, right })
                    }
                    BinaryOperator::Or => {
                        return Ok(Expression::Logical { op: LogicalOp::Or, left, right })
                    }
                    _ => return Err(unsupported(expr)),
                };
                Ok(Expression::Comparison { op: compare, left, right })
            }
            Expr::Between {
                expr: subject,
                negated: false,
                low,
                high,
            } => {
                let subject = Expression::from_sql(subject)?;
                Ok(Expression::Logical {
                    op: LogicalOp::And,
                    left: Box::new(Expression::Comparison {
                        op: CompareOp::GtEq,
                        left: Box::new(subject.clone()),
                        right: Box::new(Expression::from_sql(low)?),
                    }),
                    right: Box::new(Expression::Comparison {
                        op: CompareOp::LtEq,
                        left: Box::new(subject),
                        right: Box::new(Expression::from_sql(high)?),
                    }),
                })
            }
            _ => Err(unsupported(expr)),
        }
    }
}

fn unsupported(expr: &Expr) -> DispatchError {
    DispatchError::Unsupported(format!("HAVING expression `{}`", expr))
}

fn literal_value(value: &SqlValue, negate: bool) -> Result<Value, DispatchError> {
    let out = match value {
        SqlValue::Number(n, _) => {
            let text = if negate { format!("-{}", n) } else { n.clone() };
            match text.parse::<i64>() {
                Ok(i) => Value::Integer(i),
                Err(_) => text
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| DispatchError::Unsupported(format!("numeric literal `{}`", text)))?,
            }
        }
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) if !negate => {
            Value::String(s.clone())
        }
        SqlValue::Boolean(b) if !negate => Value::Bool(*b),
        SqlValue::Null if !negate => Value::Null,
        other => {
            return Err(DispatchError::Unsupported(format!(
                "HAVING literal `{}`",
                other
            )))
        }
    };
    Ok(out)
}

/// Evaluate an expression against one merged row.
///
/// Comparisons involving a null side are `false`, for every operator.
/// `AND`/`OR` evaluate both sides.
pub fn evaluate(expr: &Expression, row: &Row) -> Result<Value, HavingError> {
    match expr {
        Expression::Literal { value } => Ok(value.clone()),
        Expression::ColumnRef { name } => Ok(row.get_ignore_case(name).cloned().unwrap_or(Value::Null)),
        // Unreliable when a row carries more than one numeric column.
        Expression::AggregateRef { .. } => Ok(row
            .values()
            .find(|v| v.is_numeric())
            .cloned()
            .unwrap_or(Value::Null)),
        Expression::Comparison { op, left, right } => {
            let l = evaluate(left, row)?;
            let r = evaluate(right, row)?;
            if l.is_null() || r.is_null() {
                return Ok(Value::Bool(false));
            }
            match l.compare(&r) {
                Some(ordering) => Ok(Value::Bool(op.holds(ordering))),
                None => Err(HavingError::Incomparable {
                    left: l.to_string(),
                    right: r.to_string(),
                }),
            }
        }
        Expression::Logical { op, left, right } => {
            let l = as_bool(*op, evaluate(left, row)?)?;
            let r = as_bool(*op, evaluate(right, row)?)?;
            Ok(Value::Bool(match op {
                LogicalOp::And => l && r,
                LogicalOp::Or => l || r,
            }))
        }
    }
}

fn as_bool(op: LogicalOp, value: Value) -> Result<bool, HavingError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(HavingError::NotBoolean {
            op,
            value: other.to_string(),
        }),
    }
}

/// Keep the rows for which the predicate evaluates to `true`. Rows whose
/// evaluation fails are dropped without failing the request.
pub fn filter(rows: Vec<Row>, predicate: &Expression) -> Vec<Row> {
    rows.into_iter()
        .filter(|row| match evaluate(predicate, row) {
            Ok(Value::Bool(keep)) => keep,
            Ok(_) => false,
            Err(e) => {
                debug!("HAVING dropped row: {}", e);
                false
            }
        })
        .collect()
}
