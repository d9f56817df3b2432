#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, SelectItem,
    SetExpr, Statement, TableFactor, UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use shardq::bounds::StaticBoundsProvider;
use shardq::parser::display_name;
use shardq::transport::WorkerTransport;
use shardq::{DispatchError, ProcessorSettings, QueryProcessor, Row, Value};

static INIT: Once = Once::new();

pub fn init_test_env() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// A worker holding a single table `numbers(id)` with ids `low..=high`.
///
/// It evaluates the narrow SQL subset the dispatcher generates: one SELECT
/// over `numbers`, integer arithmetic, comparisons, BETWEEN, AND/OR, the five
/// aggregates and GROUP BY on expressions or projection aliases.
pub struct NumbersWorker {
    low: i64,
    high: i64,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl NumbersWorker {
    pub fn new(low: i64, high: i64) -> Self {
        NumbersWorker {
            low,
            high,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerTransport for NumbersWorker {
    async fn execute(&self, sql: &str) -> shardq::Result<Vec<Row>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(sql.to_string());
        evaluate(sql, self.low, self.high).map_err(DispatchError::Transport)
    }
}

/// Fails every statement containing `marker`, delegates the rest.
pub struct FailingWorker {
    pub inner: NumbersWorker,
    pub marker: String,
}

#[async_trait]
impl WorkerTransport for FailingWorker {
    async fn execute(&self, sql: &str) -> shardq::Result<Vec<Row>> {
        if sql.contains(&self.marker) {
            return Err(DispatchError::Transport(format!("worker crashed on: {}", sql)));
        }
        self.inner.execute(sql).await
    }
}

/// Sleeps for `delay` on every statement containing `marker`.
pub struct SlowWorker {
    pub inner: NumbersWorker,
    pub marker: String,
    pub delay: Duration,
}

#[async_trait]
impl WorkerTransport for SlowWorker {
    async fn execute(&self, sql: &str) -> shardq::Result<Vec<Row>> {
        if sql.contains(&self.marker) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.execute(sql).await
    }
}

pub fn numbers_bounds(low: i64, high: i64) -> StaticBoundsProvider {
    StaticBoundsProvider::new().with("numbers", "id", low, high)
}

pub fn settings(max_parts: usize) -> ProcessorSettings {
    ProcessorSettings {
        max_parts,
        ..ProcessorSettings::default()
    }
}

/// A processor over `numbers(low..=high)` with matching static bounds.
pub fn numbers_processor(low: i64, high: i64, max_parts: usize) -> (QueryProcessor, Arc<NumbersWorker>) {
    init_test_env();
    let worker = Arc::new(NumbersWorker::new(low, high));
    let processor = QueryProcessor::new(
        Arc::new(numbers_bounds(low, high)),
        worker.clone(),
        Arc::default(),
        settings(max_parts),
    );
    (processor, worker)
}

pub fn int(row: &Row, column: &str) -> i64 {
    match row.get(column) {
        Some(Value::Integer(i)) => *i,
        other => panic!("column {} is not an integer: {:?}", column, other),
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

pub fn evaluate(sql: &str, low: i64, high: i64) -> Result<Vec<Row>, String> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql).map_err(|e| e.to_string())?;
    let query = match statements.as_slice() {
        [Statement::Query(query)] => query,
        _ => return Err(format!("unsupported statement: {}", sql)),
    };
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        _ => return Err(format!("unsupported query body: {}", sql)),
    };
    if select.having.is_some() {
        return Err("HAVING reached a worker".to_string());
    }
    match select.from.first().map(|t| &t.relation) {
        Some(TableFactor::Table { name, .. }) if name.to_string() == "numbers" => {}
        _ => return Err(format!("relation in `{}` does not exist", sql)),
    }

    let mut ids = Vec::new();
    for id in low..=high {
        let keep = match &select.selection {
            Some(predicate) => eval_bool(predicate, id)?,
            None => true,
        };
        if keep {
            ids.push(id);
        }
    }

    let mut items: Vec<(String, Expr)> = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) => items.push(("id".to_string(), Expr::Identifier("id".into()))),
            SelectItem::UnnamedExpr(expr) => items.push((display_name(expr), expr.clone())),
            SelectItem::ExprWithAlias { expr, alias } => items.push((alias.value.clone(), expr.clone())),
            other => return Err(format!("unsupported projection {}", other)),
        }
    }

    let group_by: Vec<Expr> = match &select.group_by {
        GroupByExpr::Expressions(exprs, _) => exprs
            .iter()
            .map(|e| match e {
                Expr::Identifier(ident) => items
                    .iter()
                    .find(|(name, _)| *name == ident.value)
                    .map(|(_, expr)| expr.clone())
                    .unwrap_or_else(|| e.clone()),
                _ => e.clone(),
            })
            .collect(),
        GroupByExpr::All(_) => return Err("GROUP BY ALL is not supported".to_string()),
    };

    let aggregated = items.iter().any(|(_, e)| aggregate_call(e).is_some());
    if !aggregated && group_by.is_empty() {
        return ids
            .iter()
            .map(|id| {
                items
                    .iter()
                    .map(|(name, expr)| Ok((name.clone(), Value::Integer(eval_int(expr, *id)?))))
                    .collect::<Result<Row, String>>()
            })
            .collect();
    }

    let mut order: Vec<Vec<i64>> = Vec::new();
    let mut groups: HashMap<Vec<i64>, Vec<i64>> = HashMap::new();
    if group_by.is_empty() {
        order.push(Vec::new());
        groups.insert(Vec::new(), ids);
    } else {
        for id in ids {
            let key = group_by.iter().map(|e| eval_int(e, id)).collect::<Result<Vec<_>, _>>()?;
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(id);
        }
    }

    let mut rows = Vec::new();
    for key in order {
        let members = &groups[&key];
        let mut row = Row::new();
        for (name, expr) in &items {
            let value = match aggregate_call(expr) {
                Some((func, arg)) => aggregate(&func, arg.as_ref(), members)?,
                None => match members.first() {
                    Some(id) => Value::Integer(eval_int(expr, *id)?),
                    None => Value::Null,
                },
            };
            row.insert(name.clone(), value);
        }
        rows.push(row);
    }
    Ok(rows)
}

/// The aggregate name and argument (`None` for `*`) of a top-level call.
fn aggregate_call(expr: &Expr) -> Option<(String, Option<Expr>)> {
    let func = match expr {
        Expr::Function(func) => func,
        _ => return None,
    };
    let name = func.name.to_string().to_lowercase();
    if !["count", "sum", "min", "max", "avg"].contains(&name.as_str()) {
        return None;
    }
    let arg = match &func.args {
        FunctionArguments::List(list) => match list.args.first() {
            Some(FunctionArg::Unnamed(FunctionArgExpr::Expr(e))) => Some(e.clone()),
            _ => None,
        },
        _ => None,
    };
    Some((name, arg))
}

fn aggregate(func: &str, arg: Option<&Expr>, ids: &[i64]) -> Result<Value, String> {
    let values = match arg {
        Some(expr) => ids.iter().map(|id| eval_int(expr, *id)).collect::<Result<Vec<_>, _>>()?,
        None => ids.to_vec(),
    };
    if func == "count" {
        return Ok(Value::Integer(values.len() as i64));
    }
    if values.is_empty() {
        return Ok(Value::Null);
    }
    Ok(match func {
        "sum" => Value::Integer(values.iter().sum()),
        "min" => Value::Integer(*values.iter().min().unwrap()),
        "max" => Value::Integer(*values.iter().max().unwrap()),
        _ => Value::Float(values.iter().sum::<i64>() as f64 / values.len() as f64),
    })
}

fn eval_int(expr: &Expr, id: i64) -> Result<i64, String> {
    match expr {
        Expr::Identifier(ident) if ident.value.eq_ignore_ascii_case("id") => Ok(id),
        Expr::Value(SqlValue::Number(n, _)) => n.parse().map_err(|_| format!("bad number {}", n)),
        Expr::Nested(inner) => eval_int(inner, id),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => Ok(-eval_int(expr, id)?),
        Expr::BinaryOp { left, op, right } => {
            let (l, r) = (eval_int(left, id)?, eval_int(right, id)?);
            match op {
                BinaryOperator::Plus => Ok(l + r),
                BinaryOperator::Minus => Ok(l - r),
                BinaryOperator::Multiply => Ok(l * r),
                BinaryOperator::Divide if r != 0 => Ok(l / r),
                BinaryOperator::Modulo if r != 0 => Ok(l % r),
                _ => Err(format!("unsupported arithmetic {}", expr)),
            }
        }
        _ => Err(format!("column or expression `{}` does not exist", expr)),
    }
}

fn eval_bool(expr: &Expr, id: i64) -> Result<bool, String> {
    match expr {
        Expr::Nested(inner) => eval_bool(inner, id),
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => Ok(!eval_bool(expr, id)?),
        Expr::Between {
            expr,
            negated,
            low,
            high,
        } => {
            let v = eval_int(expr, id)?;
            let inside = eval_int(low, id)? <= v && v <= eval_int(high, id)?;
            Ok(inside != *negated)
        }
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And => Ok(eval_bool(left, id)? & eval_bool(right, id)?),
            BinaryOperator::Or => Ok(eval_bool(left, id)? | eval_bool(right, id)?),
            _ => {
                let (l, r) = (eval_int(left, id)?, eval_int(right, id)?);
                match op {
                    BinaryOperator::Gt => Ok(l > r),
                    BinaryOperator::Lt => Ok(l < r),
                    BinaryOperator::GtEq => Ok(l >= r),
                    BinaryOperator::LtEq => Ok(l <= r),
                    BinaryOperator::Eq => Ok(l == r),
                    BinaryOperator::NotEq => Ok(l != r),
                    _ => Err(format!("unsupported predicate {}", expr)),
                }
            }
        },
        _ => Err(format!("unsupported predicate {}", expr)),
    }
}
