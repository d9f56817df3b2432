// src/query_processor/mod.rs

// Pipeline orchestrator (QueryProcessor)
// parse → classify (once) → plan → scatter/gather → merge → HAVING

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::Serialize;
use uuid::Uuid;

use crate::bounds::BoundsProvider;
use crate::dispatcher::{settle, Dispatcher, FailurePolicy};
use crate::error::Result;
use crate::having;
use crate::merge;
use crate::metrics::DispatchMetrics;
use crate::parser::{self, ParsedQuery, QueryShape};
use crate::partitioner::{unsplit, Partitioner};
use crate::structs::{Row, SubQuery, WorkerResponse};
use crate::transport::WorkerTransport;

/// Dispatch settings shared by every request.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub max_parts: usize,
    pub worker_timeout: Duration,
    pub partial_results: bool,
    pub default_partition_column: String,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        ProcessorSettings {
            max_parts: 4,
            worker_timeout: Duration::from_secs(30),
            partial_results: false,
            default_partition_column: "id".to_string(),
        }
    }
}

/// The classified shape of a statement and the sub-queries it would run.
#[derive(Debug, Serialize)]
pub struct QueryPlan {
    pub shape: QueryShape,
    pub subqueries: Vec<SubQuery>,
}

pub struct QueryProcessor {
    partitioner: Partitioner,
    dispatcher: Dispatcher,
    policy: FailurePolicy,
    max_parts: usize,
    metrics: Arc<DispatchMetrics>,
}

impl QueryProcessor {
    pub fn new(
        bounds: Arc<dyn BoundsProvider>,
        transport: Arc<dyn WorkerTransport>,
        metrics: Arc<DispatchMetrics>,
        settings: ProcessorSettings,
    ) -> Self {
        QueryProcessor {
            partitioner: Partitioner::new(bounds, settings.default_partition_column),
            dispatcher: Dispatcher::new(transport, settings.worker_timeout),
            policy: FailurePolicy::from_partial_results(settings.partial_results),
            max_parts: settings.max_parts.max(1),
            metrics,
        }
    }

    pub fn max_parts(&self) -> usize {
        self.max_parts
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    /// Classify `sql` and generate its sub-queries without contacting a worker.
    pub async fn plan(&self, sql: &str) -> Result<QueryPlan> {
        let parsed = parser::parse(sql)?;
        let shape = parser::classify(&parsed)?;
        let subqueries = self.subqueries(&parsed, &shape).await;
        Ok(QueryPlan { shape, subqueries })
    }

    /// Run `sql` across the workers and return the merged, HAVING-filtered rows.
    pub async fn run(&self, sql: &str) -> Result<Vec<Row>> {
        self.metrics.record_request();
        let result = self.dispatch(sql).await;
        if result.is_err() {
            self.metrics.record_request_failed();
        }
        result
    }

    async fn dispatch(&self, sql: &str) -> Result<Vec<Row>> {
        let request_id = Uuid::new_v4();
        let started = Instant::now();

        let parsed = parser::parse(sql)?;
        let shape = parser::classify(&parsed)?;
        debug!(
            "[{}] Classified: aggregate={:?} group_by={:?} table={:?} range={:?}",
            request_id, shape.agg_type, shape.group_by_keys, shape.table_name, shape.explicit_range
        );

        let subqueries = self.subqueries(&parsed, &shape).await;
        info!("[{}] Dispatching {} sub-query(ies)", request_id, subqueries.len());
        self.metrics.record_splits(subqueries.len());

        let responses = self.dispatcher.execute(&subqueries).await;
        self.metrics
            .record_worker_failures(responses.iter().filter(|r| !r.ok).count());
        let responses = settle(responses, self.policy)?;

        let merged = merge_responses(&shape, &responses)?;
        debug!("[{}] Merged {} row(s)", request_id, merged.len());

        let rows = match &shape.having_predicate {
            Some(predicate) => {
                let before = merged.len();
                let kept = having::filter(merged, predicate);
                debug!("[{}] HAVING kept {} of {} row(s)", request_id, kept.len(), before);
                kept
            }
            None => merged,
        };

        info!(
            "[{}] Returned {} row(s) in {}ms",
            request_id,
            rows.len(),
            started.elapsed().as_millis()
        );
        Ok(rows)
    }

    async fn subqueries(&self, parsed: &ParsedQuery, shape: &QueryShape) -> Vec<SubQuery> {
        if Partitioner::can_split(shape) {
            self.partitioner.plan(parsed, shape, self.max_parts).await
        } else {
            vec![unsplit(parsed)]
        }
    }
}

/// Pick the merge path for `shape`.
pub fn merge_responses(shape: &QueryShape, responses: &[WorkerResponse]) -> Result<Vec<Row>> {
    match shape.agg_type {
        Some(kind) if shape.is_grouped() => {
            merge::merge_grouped_aggregate(responses, kind, shape.agg_alias.as_deref())
        }
        Some(kind) => merge::merge_scalar_aggregate(responses, kind),
        None => Ok(merge::merge_rows(responses)),
    }
}
