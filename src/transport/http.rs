//! HTTP transport for the data source.
//!
//! Endpoints:
//! - `POST /query`: query batch, same body as a stdio `queryData` request
//! - `POST /health`: health check of the given (or default) data source
//! - `GET /healthz`: process liveness

use crate::datasource::InstanceSettings;
use crate::error::{DbError, DbResult};
use crate::models::DataQuery;
use crate::service::{DataSourceService, Method, ServiceRequest, ServiceResponse};
use crate::transport::{Transport, wait_for_signal};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// HTTP transport implementation.
pub struct HttpTransport {
    service: Arc<DataSourceService>,
    /// Host to bind to
    host: String,
    /// Port to bind to
    port: u16,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    pub fn new(service: Arc<DataSourceService>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service,
            host: host.into(),
            port,
        }
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Request body of both POST endpoints.
#[derive(Debug, Default, Deserialize)]
struct HttpRequest {
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(default)]
    datasource: Option<InstanceSettings>,
    #[serde(default)]
    queries: Vec<DataQuery>,
}

impl HttpRequest {
    fn into_service_request(self, method: Method) -> ServiceRequest {
        ServiceRequest {
            id: self.id,
            method,
            datasource: self.datasource,
            queries: self.queries,
        }
    }
}

/// Build the router serving the data source endpoints.
pub fn router(service: Arc<DataSourceService>) -> Router {
    Router::new()
        .route("/query", post(query_handler))
        .route("/health", post(health_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(service)
}

async fn query_handler(
    State(service): State<Arc<DataSourceService>>,
    Json(body): Json<HttpRequest>,
) -> (StatusCode, Json<ServiceResponse>) {
    respond(service.handle(body.into_service_request(Method::QueryData)).await)
}

async fn health_handler(
    State(service): State<Arc<DataSourceService>>,
    Json(body): Json<HttpRequest>,
) -> (StatusCode, Json<ServiceResponse>) {
    respond(service.handle(body.into_service_request(Method::CheckHealth)).await)
}

fn respond(response: ServiceResponse) -> (StatusCode, Json<ServiceResponse>) {
    let status = if response.error.is_some() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    (status, Json(response))
}

impl Transport for HttpTransport {
    async fn run(&self) -> DbResult<()> {
        let bind_addr = self.bind_addr();
        info!("Starting data source with HTTP transport on {}", bind_addr);

        let app = router(self.service.clone());

        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            DbError::connection(
                format!("Failed to bind to {}: {}", bind_addr, e),
                "Check that the port is available",
            )
        })?;

        // Long-running queries may hold connections open, so shutdown is forced
        // after a timeout once the signal arrives.
        const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

        let shutdown_notify = Arc::new(tokio::sync::Notify::new());
        let shutdown_notify_clone = shutdown_notify.clone();
        let cancel = self.service.shutdown_token();

        let shutdown_signal = async move {
            wait_for_signal().await;
            // Abort running queries so their responses go out promptly.
            cancel.cancel();
            shutdown_notify_clone.notify_one();
        };

        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal);

        tokio::select! {
            result = server => {
                match result {
                    Ok(()) => info!("HTTP server stopped"),
                    Err(e) => {
                        error!(error = %e, "HTTP server error");
                        self.service.shutdown().await;
                        return Err(DbError::internal(format!("HTTP server error: {}", e)));
                    }
                }
            }
            _ = async {
                shutdown_notify.notified().await;
                info!(
                    timeout_secs = GRACEFUL_TIMEOUT.as_secs(),
                    "Waiting for connections to close (send signal again to force exit)..."
                );

                tokio::select! {
                    _ = tokio::time::sleep(GRACEFUL_TIMEOUT) => {
                        warn!("Graceful shutdown timeout, forcing exit");
                    }
                    _ = wait_for_signal() => {
                        warn!("Received second signal, forcing immediate exit");
                    }
                }
            } => {}
        }

        self.service.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{DataSourceOptions, InstanceManager};
    use crate::db::testing::RecordingDriver;

    fn service() -> Arc<DataSourceService> {
        let manager = Arc::new(InstanceManager::new(
            Arc::new(RecordingDriver::new()),
            DataSourceOptions::default(),
        ));
        Arc::new(DataSourceService::new(manager, None))
    }

    #[test]
    fn test_http_transport_creation() {
        let transport = HttpTransport::new(service(), "127.0.0.1", 8080);
        assert_eq!(transport.name(), "http");
        assert_eq!(transport.bind_addr(), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_query_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(service())).await.unwrap();
        });

        let body = r#"{"datasource":{"uid":"m","jsonData":{"path":""}},"queries":[{"refId":"A","json":{"rawSql":"SELECT 1"}}]}"#;
        let request = format!(
            "POST /query HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            addr,
            body.len(),
            body
        );

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        assert!(raw.starts_with("HTTP/1.1 200"));
        let json = raw.split("\r\n\r\n").nth(1).unwrap();
        let value: JsonValue = serde_json::from_str(json).unwrap();
        assert_eq!(value["result"]["responses"]["A"]["status"], 200);
    }
}
