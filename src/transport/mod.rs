// src/transport/mod.rs

// Worker transport
// Sends one SQL statement to a worker and returns its rows.

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::structs::Row;

#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Execute `sql` on a worker. The dispatcher records an `Err` as a
    /// failed response for that partition.
    async fn execute(&self, sql: &str) -> Result<Vec<Row>>;
}

#[derive(Serialize, Debug)]
struct ExecuteRequest<'a> {
    sql: &'a str,
}

#[derive(Deserialize, Debug)]
struct ExecuteResponse {
    #[serde(default)]
    rows: Option<Vec<Row>>,
}

/// POSTs `{"sql": ...}` to a worker endpoint and reads `{"rows": [...]}`.
pub struct HttpWorkerTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpWorkerTransport {
    pub fn new(url: impl Into<String>) -> Self {
        HttpWorkerTransport {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl WorkerTransport for HttpWorkerTransport {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>> {
        let response = self
            .client
            .post(&self.url)
            .json(&ExecuteRequest { sql })
            .send()
            .await
            .map_err(|e| DispatchError::Transport(format!("request to {} failed: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Transport(format!("worker returned {}: {}", status, body)));
        }

        let body: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| DispatchError::Transport(format!("invalid worker response: {}", e)))?;
        let rows = body.rows.unwrap_or_default();
        debug!("Worker at {} returned {} row(s)", self.url, rows.len());
        Ok(rows)
    }
}
