// src/dispatcher/mod.rs

// Scatter/gather dispatcher
// Issues all sub-queries at once and waits for every one of them. Each call
// is bounded by a timeout, so the gather step always completes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::error::{DispatchError, Result};
use crate::structs::{SubQuery, WorkerResponse};
use crate::transport::WorkerTransport;

/// What to do with failed worker responses before merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Any failure fails the whole request.
    Abort,
    /// Failed partitions are left out of the result.
    Skip,
}

impl FailurePolicy {
    pub fn from_partial_results(partial_results: bool) -> Self {
        if partial_results {
            FailurePolicy::Skip
        } else {
            FailurePolicy::Abort
        }
    }
}

pub struct Dispatcher {
    transport: Arc<dyn WorkerTransport>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn WorkerTransport>, timeout: Duration) -> Self {
        Dispatcher { transport, timeout }
    }

    /// Run every sub-query concurrently. The result has one entry per
    /// sub-query, in sub-query order.
    pub async fn execute(&self, subqueries: &[SubQuery]) -> Vec<WorkerResponse> {
        let mut handles = Vec::with_capacity(subqueries.len());

        for (partition, sub) in subqueries.iter().enumerate() {
            let transport = Arc::clone(&self.transport);
            let sql = sub.sql.clone();
            let timeout = self.timeout;

            handles.push(tokio::spawn(async move {
                let started = Instant::now();
                let result = tokio::time::timeout(timeout, transport.execute(&sql)).await;
                let elapsed_ms = started.elapsed().as_millis();

                match result {
                    Ok(Ok(rows)) => {
                        debug!(
                            "Partition {} returned {} row(s) in {}ms",
                            partition,
                            rows.len(),
                            elapsed_ms
                        );
                        WorkerResponse::success(partition, rows)
                    }
                    Ok(Err(e)) => {
                        error!("Partition {} failed after {}ms: {}", partition, elapsed_ms, e);
                        WorkerResponse::failure(partition, e.to_string())
                    }
                    Err(_) => {
                        error!("Partition {} timed out after {}ms", partition, timeout.as_millis());
                        WorkerResponse::failure(
                            partition,
                            format!("timed out after {}ms", timeout.as_millis()),
                        )
                    }
                }
            }));
        }

        let mut responses = Vec::with_capacity(handles.len());
        for (partition, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(response) => responses.push(response),
                Err(e) => responses.push(WorkerResponse::failure(partition, format!("task join error: {}", e))),
            }
        }
        responses
    }
}

/// Apply the failure policy to a gathered response set.
pub fn settle(responses: Vec<WorkerResponse>, policy: FailurePolicy) -> Result<Vec<WorkerResponse>> {
    match policy {
        FailurePolicy::Abort => {
            if let Some(failed) = responses.iter().find(|r| !r.ok) {
                return Err(DispatchError::Worker {
                    worker: failed.partition,
                    detail: failed.error_detail.clone().unwrap_or_default(),
                });
            }
            Ok(responses)
        }
        FailurePolicy::Skip => Ok(responses
            .into_iter()
            .filter(|r| {
                if !r.ok {
                    warn!(
                        "Partial results mode: ignoring partition {}: {}",
                        r.partition,
                        r.error_detail.as_deref().unwrap_or("")
                    );
                }
                r.ok
            })
            .collect()),
    }
}
