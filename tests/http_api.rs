mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{json, Value as Json};

use common::{numbers_bounds, numbers_processor, settings, FailingWorker, NumbersWorker};
use shardq::web_server::router;
use shardq::QueryProcessor;

/// Serve `processor` on an ephemeral port and return its base URL.
async fn spawn_server(processor: QueryProcessor) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let app = router(Arc::new(processor));
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn post(base: &str, path: &str, body: Json) -> (u16, Json) {
    let response = reqwest::Client::new()
        .post(format!("{}{}", base, path))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn query_returns_merged_rows() {
    let (processor, _) = numbers_processor(1, 100, 4);
    let base = spawn_server(processor).await;

    let (status, body) = post(&base, "/query", json!({ "sql": "SELECT COUNT(*) FROM numbers" })).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({ "rows": [{ "result": 100 }] }));
}

#[tokio::test]
async fn grouped_rows_keep_column_order() {
    let (processor, _) = numbers_processor(1, 20, 2);
    let base = spawn_server(processor).await;

    let (status, body) = post(
        &base,
        "/query",
        json!({ "sql": "SELECT id % 2 AS parity, COUNT(*) AS c FROM numbers GROUP BY parity" }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({ "rows": [{ "parity": 1, "c": 10 }, { "parity": 0, "c": 10 }] }));
}

#[tokio::test]
async fn missing_sql_is_a_bad_request() {
    let (processor, worker) = numbers_processor(1, 100, 4);
    let base = spawn_server(processor).await;

    for body in [json!({}), json!({ "sql": null }), json!({ "sql": "   " })] {
        let (status, reply) = post(&base, "/query", body).await;
        assert_eq!(status, 400);
        assert!(reply["error"].as_str().unwrap().contains("sql"));
    }
    assert_eq!(worker.calls(), 0);
}

#[tokio::test]
async fn malformed_sql_is_a_bad_request() {
    let (processor, _) = numbers_processor(1, 100, 4);
    let base = spawn_server(processor).await;

    let (status, reply) = post(&base, "/query", json!({ "sql": "SELEC * FROM numbers" })).await;
    assert_eq!(status, 400);
    assert!(reply["error"].as_str().unwrap().starts_with("SQL parse error"));
}

#[tokio::test]
async fn unparsable_body_is_a_bad_request() {
    let (processor, _) = numbers_processor(1, 100, 4);
    let base = spawn_server(processor).await;

    let response = reqwest::Client::new()
        .post(format!("{}/query", base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let reply: Json = response.json().await.unwrap();
    assert!(reply["error"].is_string());
}

#[tokio::test]
async fn worker_failure_is_an_upstream_error() {
    let worker = FailingWorker {
        inner: NumbersWorker::new(1, 100),
        marker: "BETWEEN 76 AND 100".to_string(),
    };
    let processor = QueryProcessor::new(Arc::new(numbers_bounds(1, 100)), Arc::new(worker), Arc::default(), settings(4));
    let base = spawn_server(processor).await;

    let (status, reply) = post(&base, "/query", json!({ "sql": "SELECT * FROM numbers" })).await;
    assert_eq!(status, 502);
    assert!(reply["error"].as_str().unwrap().contains("partition 3"));
}

#[tokio::test]
async fn plan_shows_subqueries_without_dispatching() {
    let (processor, worker) = numbers_processor(1, 100, 4);
    let base = spawn_server(processor).await;

    let (status, body) = post(
        &base,
        "/plan",
        json!({ "sql": "SELECT id % 10 AS m, COUNT(*) AS c FROM numbers GROUP BY m HAVING c > 5" }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["shape"]["agg_type"], json!("count"));
    assert_eq!(body["shape"]["group_by_keys"], json!(["m"]));
    assert_eq!(body["subqueries"].as_array().unwrap().len(), 4);
    assert_eq!(body["subqueries"][1]["range"], json!({ "start": 26, "end": 50 }));
    assert_eq!(
        body["subqueries"][0]["sql"],
        json!("SELECT id % 10 AS m, COUNT(*) AS c FROM numbers WHERE id BETWEEN 1 AND 25 GROUP BY m")
    );
    assert_eq!(worker.calls(), 0);
}

#[tokio::test]
async fn health_reports_fan_out() {
    let (processor, _) = numbers_processor(1, 100, 6);
    let base = spawn_server(processor).await;

    let body: Json = reqwest::get(format!("{}/health", base)).await.unwrap().json().await.unwrap();
    assert_eq!(body, json!({ "status": "ok", "max_parts": 6 }));
}

#[tokio::test]
async fn metrics_count_requests_and_splits() {
    let (processor, _) = numbers_processor(1, 100, 4);
    let base = spawn_server(processor).await;

    post(&base, "/query", json!({ "sql": "SELECT COUNT(*) FROM numbers" })).await;
    post(&base, "/query", json!({ "sql": "SELECT MAX(id) FROM numbers" })).await;
    post(&base, "/plan", json!({ "sql": "SELECT * FROM numbers" })).await;

    let response = reqwest::get(format!("{}/metrics", base)).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.headers()["content-type"].to_str().unwrap().starts_with("text/plain"));
    let text = response.text().await.unwrap();
    assert!(text.contains("\ndispatcher_requests_total 2\n"), "{}", text);
    assert!(text.contains("\ndispatcher_splits_total 8\n"), "{}", text);
    assert!(text.contains("\ndispatcher_worker_failures_total 0\n"), "{}", text);
}
