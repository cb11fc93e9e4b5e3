//! DuckDB data source - Main entry point.
//!
//! Serves query and health-check requests against embedded DuckDB databases
//! and MotherDuck catalogs over stdio or HTTP.

use clap::Parser;
use duckdb_datasource::config::{Config, TransportMode};
use duckdb_datasource::datasource::{DataSourceOptions, InstanceManager};
use duckdb_datasource::db::DuckDbDriver;
use duckdb_datasource::service::DataSourceService;
use duckdb_datasource::transport::{HttpTransport, StdioTransport, Transport};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr; stdout carries stdio transport responses.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!(
        transport = %config.transport,
        "Starting DuckDB data source v{}",
        env!("CARGO_PKG_VERSION")
    );

    let default_settings = match &config.settings {
        Some(path) => {
            info!(path = %path.display(), "Loading default data source settings");
            Some(DataSourceService::load_settings(path)?)
        }
        None => None,
    };

    let options = DataSourceOptions {
        data_dir: config.data_dir.clone(),
        query_timeout: config.query_timeout_duration(),
    };
    let manager = Arc::new(InstanceManager::new(Arc::new(DuckDbDriver::new()), options));

    // Connect the default data source eagerly so configuration errors surface at startup
    if let Some(settings) = &default_settings {
        manager.get(settings).await?;
    }

    let service = Arc::new(DataSourceService::new(manager, default_settings));

    // Run the appropriate transport
    let result = match config.transport {
        TransportMode::Stdio => {
            info!("Using stdio transport");
            StdioTransport::new(service).run().await
        }
        TransportMode::Http => {
            info!(
                host = %config.http_host,
                port = config.http_port,
                "Using HTTP transport"
            );
            HttpTransport::new(service, &config.http_host, config.http_port)
                .run()
                .await
        }
    };

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
