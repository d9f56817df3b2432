// src/bounds/mod.rs

// Partition bounds lookup (BoundsProvider)
// Resolves the numeric [min, max] of a table column. "Unknown" is never an
// error for the request: it only turns splitting off.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::error::{DispatchError, Result};

#[async_trait]
pub trait BoundsProvider: Send + Sync {
    /// Inclusive (min, max) of `column` in `table`, or `None` if unknown.
    async fn bounds(&self, table: &str, column: &str) -> Option<(i64, i64)>;
}

/// Used when no bounds source is configured.
pub struct NoBounds;

#[async_trait]
impl BoundsProvider for NoBounds {
    async fn bounds(&self, _table: &str, _column: &str) -> Option<(i64, i64)> {
        None
    }
}

/// Fixed bounds keyed by (table, column).
#[derive(Debug, Clone, Default)]
pub struct StaticBoundsProvider {
    entries: HashMap<(String, String), (i64, i64)>,
}

impl StaticBoundsProvider {
    pub fn new() -> Self {
        StaticBoundsProvider::default()
    }

    pub fn with(mut self, table: &str, column: &str, low: i64, high: i64) -> Self {
        self.insert(table, column, low, high);
        self
    }

    pub fn insert(&mut self, table: &str, column: &str, low: i64, high: i64) {
        self.entries.insert((table.to_lowercase(), column.to_lowercase()), (low, high));
    }

    /// Parse `table.column=LOW:HIGH` (the table part may itself be
    /// schema-qualified; the column is the last dotted segment).
    pub fn parse_entry(&mut self, spec: &str) -> Result<()> {
        let bad = || DispatchError::Config(format!("invalid bounds `{}`, expected table.column=LOW:HIGH", spec));
        let (target, range) = spec.split_once('=').ok_or_else(bad)?;
        let (table, column) = target.rsplit_once('.').ok_or_else(bad)?;
        let (low, high) = range.split_once(':').ok_or_else(bad)?;
        let low = low.trim().parse::<i64>().map_err(|_| bad())?;
        let high = high.trim().parse::<i64>().map_err(|_| bad())?;
        self.insert(table.trim(), column.trim(), low, high);
        Ok(())
    }
}

#[async_trait]
impl BoundsProvider for StaticBoundsProvider {
    async fn bounds(&self, table: &str, column: &str) -> Option<(i64, i64)> {
        self.entries
            .get(&(table.to_lowercase(), column.to_lowercase()))
            .copied()
    }
}

/// Looks bounds up with `MIN`/`MAX` through a Postgres pool.
///
/// The pool is created at startup and must be closed with [`close`] on
/// shutdown.
///
/// [`close`]: PgBoundsProvider::close
pub struct PgBoundsProvider {
    pool: PgPool,
}

impl PgBoundsProvider {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(dsn)
            .await
            .map_err(|e| DispatchError::Bounds(format!("failed to connect bounds pool: {}", e)))?;
        info!("Bounds pool connected");
        Ok(PgBoundsProvider { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Bounds pool closed");
    }
}

#[async_trait]
impl BoundsProvider for PgBoundsProvider {
    async fn bounds(&self, table: &str, column: &str) -> Option<(i64, i64)> {
        let sql = bounds_query(table, column)?;
        match sqlx::query_as::<_, (Option<i64>, Option<i64>)>(&sql)
            .fetch_one(&self.pool)
            .await
        {
            Ok((Some(low), Some(high))) => Some((low, high)),
            Ok(_) => None,
            Err(e) => {
                warn!("Bounds lookup for {}.{} failed: {}", table, column, e);
                None
            }
        }
    }
}

/// Build the MIN/MAX statement, refusing anything that is not a plain
/// (optionally schema-qualified) identifier.
fn bounds_query(table: &str, column: &str) -> Option<String> {
    if !table.split('.').all(is_plain_identifier) || !is_plain_identifier(column) {
        warn!("Refusing bounds lookup for non-identifier {}.{}", table, column);
        return None;
    }
    Some(format!(
        "SELECT MIN({col})::bigint, MAX({col})::bigint FROM {table}",
        col = column,
        table = table
    ))
}

pub(crate) fn is_plain_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
