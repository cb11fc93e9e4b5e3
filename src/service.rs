//! Request handling shared by all transports.
//!
//! A request names a method (`queryData` or `checkHealth`), optionally carries
//! the data source settings, and for `queryData` the query batch. Requests
//! without settings use the default data source loaded at startup.

use crate::datasource::{InstanceManager, InstanceSettings};
use crate::error::{DbError, DbResult};
use crate::models::{CheckHealthResult, DataQuery, QueryDataRequest, QueryDataResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// UID of the data source loaded from the settings file.
pub const DEFAULT_DATASOURCE_UID: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Method {
    QueryData,
    CheckHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    /// Caller correlation id, echoed back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonValue>,
    pub method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource: Option<InstanceSettings>,
    #[serde(default)]
    pub queries: Vec<DataQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// True when the same request may succeed if sent again.
    #[serde(default)]
    pub retryable: bool,
}

impl From<&DbError> for ServiceError {
    fn from(err: &DbError) -> Self {
        Self {
            message: err.to_string(),
            suggestion: err.suggestion().map(String::from),
            retryable: err.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceResult {
    QueryData(QueryDataResponse),
    CheckHealth(CheckHealthResult),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ServiceResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceError>,
}

impl ServiceResponse {
    fn success(id: Option<JsonValue>, result: ServiceResult) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Option<JsonValue>, err: &DbError) -> Self {
        Self {
            id,
            result: None,
            error: Some(err.into()),
        }
    }
}

/// Dispatches requests to data source instances.
pub struct DataSourceService {
    manager: Arc<InstanceManager>,
    default_settings: Option<InstanceSettings>,
    shutdown: CancellationToken,
}

impl DataSourceService {
    pub fn new(manager: Arc<InstanceManager>, default_settings: Option<InstanceSettings>) -> Self {
        Self {
            manager,
            default_settings,
            shutdown: CancellationToken::new(),
        }
    }

    /// Load default settings from a JSON file
    /// (`{"jsonData": {...}, "secureJsonData": {...}}`).
    pub fn load_settings(path: &Path) -> DbResult<InstanceSettings> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DbError::config(
                format!("cannot read settings file {}: {}", path.display(), e),
                r#"{"jsonData": {"path": "/var/lib/data/analytics.duckdb"}}"#,
            )
        })?;
        let mut settings: InstanceSettings = serde_json::from_str(&text).map_err(|e| {
            DbError::config(
                format!("settings file {} is not valid JSON: {}", path.display(), e),
                r#"{"jsonData": {"path": "/var/lib/data/analytics.duckdb"}}"#,
            )
        })?;
        if settings.uid.is_empty() {
            settings.uid = DEFAULT_DATASOURCE_UID.to_string();
        }
        Ok(settings)
    }

    /// Token canceled when the service shuts down; requests derive from it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Handle one request. Errors are reported in the response.
    pub async fn handle(&self, request: ServiceRequest) -> ServiceResponse {
        let id = request.id.clone();
        if self.shutdown.is_cancelled() {
            return ServiceResponse::failure(id, &DbError::canceled("request after shutdown"));
        }
        let cancel = self.shutdown.child_token();

        let result = match request.method {
            Method::QueryData => self
                .query_data(request.datasource.as_ref(), request.queries, &cancel)
                .await
                .map(ServiceResult::QueryData),
            Method::CheckHealth => self
                .check_health(request.datasource.as_ref(), &cancel)
                .await
                .map(ServiceResult::CheckHealth),
        };

        match result {
            Ok(result) => ServiceResponse::success(id, result),
            Err(e) => {
                debug!(error = %e, "Request failed");
                ServiceResponse::failure(id, &e)
            }
        }
    }

    /// Handle one JSON-encoded request and encode the response.
    pub async fn handle_json(&self, line: &str) -> String {
        let response = match serde_json::from_str::<ServiceRequest>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => ServiceResponse::failure(None, &DbError::from(e)),
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(
                r#"{{"error":{{"message":"failed to encode response: {}"}}}}"#,
                e.to_string().replace('"', "'")
            )
        })
    }

    pub async fn query_data(
        &self,
        settings: Option<&InstanceSettings>,
        queries: Vec<DataQuery>,
        cancel: &CancellationToken,
    ) -> DbResult<QueryDataResponse> {
        let settings = self.settings_for(settings)?;
        let instance = self.manager.get(settings).await?;
        instance
            .query_data(&QueryDataRequest { queries }, cancel)
            .await
    }

    pub async fn check_health(
        &self,
        settings: Option<&InstanceSettings>,
        cancel: &CancellationToken,
    ) -> DbResult<CheckHealthResult> {
        let settings = self.settings_for(settings)?;
        // A data source that cannot be created is unhealthy, not a failed request.
        match self.manager.get(settings).await {
            Ok(instance) => Ok(instance.check_health(cancel).await),
            Err(e) => Ok(CheckHealthResult::error(e.to_string())),
        }
    }

    /// Cancel running requests and dispose every instance.
    pub async fn shutdown(&self) {
        info!("Closing all data source instances");
        self.shutdown.cancel();
        self.manager.dispose_all().await;
    }

    fn settings_for<'a>(
        &'a self,
        settings: Option<&'a InstanceSettings>,
    ) -> DbResult<&'a InstanceSettings> {
        settings.or(self.default_settings.as_ref()).ok_or_else(|| {
            DbError::invalid_input(
                "request has no datasource settings and no default settings file was given",
            )
        })
    }
}
