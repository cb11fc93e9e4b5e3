//! Stdio transport for the data source.
//!
//! Each line on stdin is one JSON request; each response is written as one
//! line on stdout. Requests are handled concurrently, so responses may come
//! back out of order and carry the request `id` for correlation.

use crate::error::{DbError, DbResult};
use crate::service::DataSourceService;
use crate::transport::{Transport, wait_for_signal};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Stdio transport implementation.
pub struct StdioTransport {
    service: Arc<DataSourceService>,
}

impl StdioTransport {
    /// Create a new stdio transport over the shared service.
    pub fn new(service: Arc<DataSourceService>) -> Self {
        Self { service }
    }
}

impl Transport for StdioTransport {
    async fn run(&self) -> DbResult<()> {
        info!("Starting data source with stdio transport");

        let reader = BufReader::new(tokio::io::stdin());
        let writer = tokio::io::stdout();

        let shutdown_requested = tokio::select! {
            result = serve_lines(self.service.clone(), reader, writer) => {
                if let Err(e) = result {
                    warn!(error = %e, "Stdio transport error");
                    self.service.shutdown().await;
                    return Err(e);
                }
                info!("Stdin closed, stopping");
                false
            }
            _ = wait_for_signal() => {
                info!("Shutdown signal received");
                true
            }
        };

        self.service.shutdown().await;

        if shutdown_requested {
            // A blocking stdin read cannot be interrupted; exit explicitly.
            info!("Exiting process");
            std::process::exit(0);
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "stdio"
    }
}

/// Serve newline-delimited requests from `reader` until EOF, writing responses
/// to `writer`. Returns once every started request has been answered.
pub async fn serve_lines<R, W>(
    service: Arc<DataSourceService>,
    reader: R,
    mut writer: W,
) -> DbResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = reader.lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| DbError::internal(format!("Failed to read stdin: {}", e)))?
    {
        if line.trim().is_empty() {
            continue;
        }
        debug!(bytes = line.len(), "Request received");

        let service = service.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = service.handle_json(&line).await;
            // The writer only goes away when stdout is broken.
            let _ = tx.send(response);
        });
    }

    // Writer finishes once every in-flight request has dropped its sender.
    drop(tx);
    writer_task
        .await
        .map_err(|e| DbError::internal(format!("Stdout writer failed: {}", e)))?
        .map_err(|e| DbError::internal(format!("Failed to write stdout: {}", e)))
}
