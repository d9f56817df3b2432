use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use shardq::bounds::{BoundsProvider, NoBounds, PgBoundsProvider};
use shardq::config::Config;
use shardq::logging;
use shardq::metrics::DispatchMetrics;
use shardq::query_processor::QueryProcessor;
use shardq::transport::HttpWorkerTransport;
use shardq::web_server::start_server;

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn run() -> Result<(), String> {
    let config = Config::parse();
    logging::init(&config.log_level);
    config.validate().map_err(|e| e.to_string())?;

    // The pool lives for the whole process and is closed after the listener stops.
    let pg = match &config.bounds_dsn {
        Some(dsn) => match PgBoundsProvider::connect(dsn).await {
            Ok(provider) => Some(Arc::new(provider)),
            Err(e) => {
                warn!("{}; queries will not be split by table bounds", e);
                None
            }
        },
        None => {
            info!("No bounds DSN configured; only explicit WHERE ranges are split");
            None
        }
    };
    let bounds: Arc<dyn BoundsProvider> = match &pg {
        Some(provider) => provider.clone(),
        None => Arc::new(NoBounds),
    };

    let transport = Arc::new(HttpWorkerTransport::new(config.worker_url.clone()));
    info!(
        "Dispatching to {} with up to {} part(s), {}ms per call",
        transport.url(),
        config.max_parts,
        config.worker_timeout_ms
    );

    let metrics = Arc::new(DispatchMetrics::new());
    let processor = Arc::new(QueryProcessor::new(
        bounds,
        transport,
        metrics.clone(),
        config.processor_settings(),
    ));
    let served = start_server(&config.listen, processor, shutdown_signal()).await;

    if let Some(provider) = pg {
        provider.close().await;
    }
    let totals = metrics.snapshot();
    info!(
        "Served {} request(s), {} sub-query(ies), {} worker failure(s)",
        totals.requests_total, totals.splits_total, totals.worker_failures_total
    );
    served
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
