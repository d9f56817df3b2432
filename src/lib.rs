pub mod config;
pub mod error;
pub mod logging;
pub mod web_server;

// Pipeline stages
pub mod structs;
pub mod parser;
pub mod having;
pub mod bounds;
pub mod partitioner;
pub mod transport;
pub mod dispatcher;
pub mod merge;
pub mod metrics;
pub mod query_processor;

// Public API
pub use error::{DispatchError, Result};
pub use metrics::{DispatchMetrics, MetricsSnapshot};
pub use parser::{classify, parse, AggKind, ParsedQuery, QueryShape};
pub use query_processor::{ProcessorSettings, QueryPlan, QueryProcessor};
pub use structs::{PartitionRange, Row, SubQuery, Value, WorkerResponse};
