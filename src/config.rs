use std::time::Duration;

use crate::error::{AppError, Result};

pub const SERVICE_NAME: &str = "agg-itemsoldflashsale-report";

/// Collection holding one document per unit sold during a flash sale.
pub const SOLD_ITEM_COLLECTION: &str = "agg_flashitemsold";

/// Collection receiving one document per generated report.
pub const REPORT_COLLECTION: &str = "agg_report_flashitemsold";

/// Aggregate id this service answers queries for. Events carrying any other
/// aggregate id are not ours and are dropped without a response.
pub const AGGREGATE_ID: i16 = 14;

/// Channel capacity for inbound query envelopes.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Upper bound on query tasks running at the same time.
pub const DEFAULT_QUERY_CONCURRENCY: usize = 16;

#[derive(Debug, Clone)]
pub struct Config {
    pub service_name: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Source collection for the aggregation (SOLD_ITEM_COLLECTION)
    pub sold_item_collection: String,
    /// Destination collection for generated reports (REPORT_COLLECTION)
    pub report_collection: String,
    /// Aggregate id accepted by the dispatcher (AGGREGATE_ID)
    pub aggregate_id: i16,
    /// Max concurrently running query tasks (QUERY_CONCURRENCY)
    pub query_concurrency: usize,
    /// How long to wait for a pooled store connection (STORE_CONNECTION_TIMEOUT_MS)
    pub store_connection_timeout: Duration,
    /// Upper bound on a single store operation (STORE_TIMEOUT_MS)
    pub store_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let cfg = Self {
            service_name: std::env::var("SERVICE_NAME").unwrap_or_else(|_| SERVICE_NAME.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "reports.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            sold_item_collection: std::env::var("SOLD_ITEM_COLLECTION")
                .unwrap_or_else(|_| SOLD_ITEM_COLLECTION.to_string()),
            report_collection: std::env::var("REPORT_COLLECTION")
                .unwrap_or_else(|_| REPORT_COLLECTION.to_string()),
            aggregate_id: std::env::var("AGGREGATE_ID")
                .unwrap_or_else(|_| AGGREGATE_ID.to_string())
                .parse::<i16>()
                .map_err(|_| AppError::Config("AGGREGATE_ID must be a 16-bit integer".to_string()))?,
            query_concurrency: std::env::var("QUERY_CONCURRENCY")
                .unwrap_or_else(|_| DEFAULT_QUERY_CONCURRENCY.to_string())
                .parse::<usize>()
                .map_err(|_| AppError::Config("QUERY_CONCURRENCY must be a positive integer".to_string()))?,
            store_connection_timeout: millis_from_env("STORE_CONNECTION_TIMEOUT_MS", 3_000)?,
            store_timeout: millis_from_env("STORE_TIMEOUT_MS", 5_000)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.sold_item_collection.trim().is_empty() {
            return Err(AppError::Config("SOLD_ITEM_COLLECTION must not be empty".to_string()));
        }
        if self.report_collection.trim().is_empty() {
            return Err(AppError::Config("REPORT_COLLECTION must not be empty".to_string()));
        }
        if self.sold_item_collection == self.report_collection {
            return Err(AppError::Config(
                "SOLD_ITEM_COLLECTION and REPORT_COLLECTION must differ".to_string(),
            ));
        }
        if self.query_concurrency == 0 {
            return Err(AppError::Config("QUERY_CONCURRENCY must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME.to_string(),
            log_level: "info".to_string(),
            db_path: "reports.db".to_string(),
            api_port: 3000,
            sold_item_collection: SOLD_ITEM_COLLECTION.to_string(),
            report_collection: REPORT_COLLECTION.to_string(),
            aggregate_id: AGGREGATE_ID,
            query_concurrency: DEFAULT_QUERY_CONCURRENCY,
            store_connection_timeout: Duration::from_millis(3_000),
            store_timeout: Duration::from_millis(5_000),
        }
    }
}

fn millis_from_env(key: &str, default_ms: u64) -> Result<Duration> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| AppError::Config(format!("{key} must be a number of milliseconds"))),
        Err(_) => Ok(Duration::from_millis(default_ms)),
    }
}
