// src/merge/mod.rs

// Result merging (MergeEngine)
// Rebuilds one result set from per-partition responses: plain concatenation,
// scalar re-aggregation, or grouped re-aggregation keyed by the non-aggregate
// columns of each row.

use std::collections::HashMap;

use log::debug;

use crate::error::{DispatchError, Result};
use crate::parser::AggKind;
use crate::structs::{Row, Value, WorkerResponse};

/// Column used for a merged aggregate that has no alias.
pub const RESULT_COLUMN: &str = "result";

/// Column names tried, in order, when a row lacks the aggregate alias.
const FALLBACK_NAMES: [&str; 5] = ["count", "sum", "min", "max", "avg"];

/// Concatenate the rows of every successful response, in response order.
pub fn merge_rows(responses: &[WorkerResponse]) -> Vec<Row> {
    responses
        .iter()
        .filter(|r| r.ok)
        .flat_map(|r| r.rows.iter().cloned())
        .collect()
}

/// Reduce one partial aggregate per response into a single `{result: v}` row.
///
/// The partial is the first value of the first row of each response.
/// With no non-null partials the result is `{result: 0}`.
pub fn merge_scalar_aggregate(responses: &[WorkerResponse], kind: AggKind) -> Result<Vec<Row>> {
    let partials: Vec<Value> = responses
        .iter()
        .filter(|r| r.ok)
        .filter_map(|r| r.rows.first())
        .filter_map(|row| row.values().next().cloned())
        .collect();

    debug!("Reducing {} {} partial(s)", partials.len(), kind.as_str());

    let value = reduce(kind, &partials)?.unwrap_or(Value::Integer(0));
    let mut row = Row::new();
    row.insert(RESULT_COLUMN, value);
    Ok(vec![row])
}

/// Re-aggregate per-group partials.
///
/// For each row the partial is read from the `alias` column, then from the
/// first of `count`, `sum`, `min`, `max`, `avg` present, then from the last
/// column. When the alias column exists, every other column is part of the
/// group key. Otherwise the key is every column whose value differs from the
/// partial, which misgroups rows where a key column happens to equal the
/// aggregate value.
///
/// Groups are emitted in first-seen order.
pub fn merge_grouped_aggregate(
    responses: &[WorkerResponse],
    kind: AggKind,
    alias: Option<&str>,
) -> Result<Vec<Row>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Vec<(String, Value)>, Vec<Value>)> = Vec::new();

    for row in responses.iter().filter(|r| r.ok).flat_map(|r| r.rows.iter()) {
        let (agg_column, partial) = match partial_of(row, alias) {
            Some(found) => found,
            None => continue,
        };

        let key: Vec<(String, Value)> = match agg_column {
            Some(column) => row
                .iter()
                .filter(|(k, _)| *k != column)
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            None => row
                .iter()
                .filter(|(_, v)| !v.loosely_equals(&partial))
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        };

        let fingerprint = serde_json::to_string(&key)
            .map_err(|e| DispatchError::Merge(format!("cannot key group: {}", e)))?;
        let slot = *index.entry(fingerprint).or_insert_with(|| {
            groups.push((key, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(partial);
    }

    debug!("Merged {} group(s)", groups.len());

    let output_column = alias.unwrap_or(RESULT_COLUMN);
    groups
        .into_iter()
        .map(|(key, partials)| {
            let mut row: Row = key.into_iter().collect();
            row.insert(output_column, reduce(kind, &partials)?.unwrap_or(Value::Null));
            Ok(row)
        })
        .collect()
}

/// The partial aggregate of a row, with the name of the column it came from
/// when that column was found by name.
fn partial_of<'a>(row: &'a Row, alias: Option<&str>) -> Option<(Option<&'a str>, Value)> {
    let named = alias
        .into_iter()
        .chain(FALLBACK_NAMES)
        .find_map(|name| row.iter().find(|(k, _)| *k == name));

    match (named, alias) {
        (Some((column, value)), Some(alias)) if column == alias => Some((Some(column), value.clone())),
        (Some((_, value)), _) => Some((None, value.clone())),
        (None, _) => row.values().last().map(|v| (None, v.clone())),
    }
}

/// Reduce partial aggregates with the rule for `kind`. Null partials are
/// ignored; `None` means there was nothing left to reduce.
pub fn reduce(kind: AggKind, partials: &[Value]) -> Result<Option<Value>> {
    let values: Vec<&Value> = partials.iter().filter(|v| !v.is_null()).collect();
    if values.is_empty() {
        return Ok(None);
    }

    let reduced = match kind {
        AggKind::Count | AggKind::Sum => sum(&values)?,
        AggKind::Avg => {
            let total = values
                .iter()
                .map(|v| numeric(v))
                .sum::<Result<f64>>()?;
            Value::Float(total / values.len() as f64)
        }
        AggKind::Min => extreme(&values, std::cmp::Ordering::Less)?,
        AggKind::Max => extreme(&values, std::cmp::Ordering::Greater)?,
    };
    Ok(Some(reduced))
}

/// Integer sum while every partial is an integer and the total fits,
/// float sum otherwise.
fn sum(values: &[&Value]) -> Result<Value> {
    let integers: Option<Vec<i64>> = values
        .iter()
        .map(|v| match v {
            Value::Integer(i) => Some(*i),
            _ => None,
        })
        .collect();

    if let Some(integers) = integers {
        if let Some(total) = integers.iter().try_fold(0i64, |acc, i| acc.checked_add(*i)) {
            return Ok(Value::Integer(total));
        }
    }

    let total = values.iter().map(|v| numeric(v)).sum::<Result<f64>>()?;
    Ok(Value::Float(total))
}

fn extreme(values: &[&Value], wanted: std::cmp::Ordering) -> Result<Value> {
    let mut best = values[0];
    for &candidate in &values[1..] {
        match candidate.compare(best) {
            Some(ordering) if ordering == wanted => best = candidate,
            Some(_) => {}
            None => {
                return Err(DispatchError::Merge(format!(
                    "cannot compare partials {} and {}",
                    candidate, best
                )))
            }
        }
    }
    Ok(best.clone())
}

fn numeric(value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| DispatchError::Merge(format!("non-numeric partial aggregate: {}", value)))
}
