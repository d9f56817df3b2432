use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use shardq::bounds::StaticBoundsProvider;
use shardq::logging;
use shardq::query_processor::{ProcessorSettings, QueryProcessor};
use shardq::transport::HttpWorkerTransport;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Plan or run a query through the shardq pipeline", long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// Log filter when RUST_LOG is not set
    #[clap(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the classified shape and the generated sub-queries
    Plan {
        sql: String,

        #[clap(long, default_value_t = 4)]
        parts: usize,

        /// Known bounds, as table.column=LOW:HIGH (repeatable)
        #[clap(long = "bounds", value_name = "TABLE.COLUMN=LOW:HIGH")]
        bounds: Vec<String>,

        /// Partition column used when the WHERE clause names none
        #[clap(long, default_value = "id")]
        partition_column: String,
    },
    /// Execute the query against a worker endpoint and print the merged rows
    Run {
        sql: String,

        #[clap(long, env = "WORKER_URL", default_value = "http://worker-svc:8001/execute")]
        worker_url: String,

        #[clap(long, default_value_t = 4)]
        parts: usize,

        /// Known bounds, as table.column=LOW:HIGH (repeatable)
        #[clap(long = "bounds", value_name = "TABLE.COLUMN=LOW:HIGH")]
        bounds: Vec<String>,

        #[clap(long, default_value = "id")]
        partition_column: String,

        #[clap(long, default_value_t = 30_000)]
        timeout_ms: u64,

        /// Keep going when some workers fail
        #[clap(long)]
        partial_results: bool,
    },
}

fn static_bounds(entries: &[String]) -> Result<StaticBoundsProvider, String> {
    let mut provider = StaticBoundsProvider::new();
    for entry in entries {
        provider.parse_entry(entry).map_err(|e| e.to_string())?;
    }
    Ok(provider)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| format!("Failed to encode output: {}", e))?;
    println!("{}", text);
    Ok(())
}

async fn run() -> Result<(), String> {
    let args = Args::parse();
    logging::init(&args.log_level);

    match args.command {
        Command::Plan {
            sql,
            parts,
            bounds,
            partition_column,
        } => {
            let settings = ProcessorSettings {
                max_parts: parts,
                default_partition_column: partition_column,
                ..ProcessorSettings::default()
            };
            // Planning never reaches a worker; the transport is only a placeholder.
            let transport = Arc::new(HttpWorkerTransport::new("http://localhost/execute"));
            let processor = QueryProcessor::new(Arc::new(static_bounds(&bounds)?), transport, Arc::default(), settings);
            let plan = processor.plan(&sql).await.map_err(|e| e.to_string())?;
            print_json(&plan)
        }
        Command::Run {
            sql,
            worker_url,
            parts,
            bounds,
            partition_column,
            timeout_ms,
            partial_results,
        } => {
            if parts == 0 || timeout_ms == 0 {
                return Err("--parts and --timeout-ms must be positive".to_string());
            }
            let settings = ProcessorSettings {
                max_parts: parts,
                worker_timeout: Duration::from_millis(timeout_ms),
                partial_results,
                default_partition_column: partition_column,
            };
            let transport = Arc::new(HttpWorkerTransport::new(worker_url));
            let processor = QueryProcessor::new(Arc::new(static_bounds(&bounds)?), transport, Arc::default(), settings);
            let rows = processor.run(&sql).await.map_err(|e| e.to_string())?;
            print_json(&rows)
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
