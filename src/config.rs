//! Configuration handling for the DuckDB data source.
//!
//! Two layers live here:
//! - [`Config`]: process configuration from CLI arguments and environment variables.
//! - [`DataSourceConfig`]: per-instance settings resolved from the inbound settings
//!   JSON and its secret companion.

use crate::error::{DbError, DbResult};
use clap::{Parser, ValueEnum};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Path prefix that addresses a MotherDuck cloud catalog instead of a local file.
pub const REMOTE_CATALOG_PREFIX: &str = "md:";

/// Environment variable naming the deployment-wide data directory.
pub const DATA_DIR_ENV: &str = "GF_PATHS_DATA";

/// Alternate spelling of the in-memory target accepted in settings.
const MEMORY_PATH_ALIAS: &str = ":memory:";

const VALID_PATH_EXAMPLE: &str = "/var/lib/grafana/data/analytics.duckdb (no surrounding quotes), \
     md:my_database for MotherDuck, or an empty path for an in-memory database";

/// Engine settings that may be passed through from the settings JSON verbatim.
pub const ALLOWED_SETTINGS: &[&str] = &[
    "access_mode",
    "checkpoint_threshold",
    "debug_checkpoint_abort",
    "debug_force_external",
    "debug_force_no_cross_product",
    "debug_asof_iejoin",
    "prefer_range_joins",
    "debug_window_mode",
    "default_collation",
    "default_order",
    "default_null_order",
    "disabled_filesystems",
    "disabled_optimizers",
    "enable_external_access",
    "enable_fsst_vectors",
    "allow_unsigned_extensions",
    "custom_extension_repository",
    "autoinstall_extension_repository",
    "autoinstall_known_extensions",
    "autoload_known_extensions",
    "enable_object_cache",
    "enable_http_metadata_cache",
    "enable_profiling",
    "enable_progress_bar",
    "enable_progress_bar_print",
    "explain_output",
    "extension_directory",
    "external_threads",
    "file_search_path",
    "force_compression",
    "force_bitpacking_mode",
    "home_directory",
    "log_query_path",
    "lock_configuration",
    "immediate_transaction_mode",
    "integer_division",
    "max_expression_depth",
    "max_memory",
    "memory_limit",
    "null_order",
    "ordered_aggregate_threshold",
    "password",
    "perfect_ht_threshold",
    "pivot_filter_threshold",
    "pivot_limit",
    "preserve_identifier_case",
    "preserve_insertion_order",
    "profiler_history_size",
    "profile_output",
    "profiling_mode",
    "profiling_output",
    "progress_bar_time",
    "schema",
    "search_path",
    "temp_directory",
    "threads",
    "username",
    "arrow_large_buffer_size",
    "user",
    "wal_autocheckpoint",
    "worker_threads",
    "allocator_flush_threshold",
    "duckdb_api",
    "custom_user_agent",
    "motherduck_saas_mode",
    "motherduck_database_uuid",
    "motherduck_use_tls",
    "motherduck_background_catalog_refresh_long_poll_timeout",
    "motherduck_background_catalog_refresh_inactivity_timeout",
    "motherduck_lease_timeout",
    "motherduck_database_name",
    "motherduck_port",
    "motherduck_log_level",
    "pandas_analyze_sample",
    "motherduck_host",
    "motherduck_background_catalog_refresh",
    "binary_as_string",
    "motherduck_token",
    "Calendar",
    "TimeZone",
];

/// Resolved, immutable configuration of one data source instance.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DataSourceConfig {
    /// Trimmed target path. Empty means an in-memory database.
    pub path: String,
    /// Catalog authentication token (sensitive - never log).
    pub secret_token: String,
    /// User initialization SQL appended to the bootstrap sequence.
    pub init_sql: String,
    /// Display name of the database, informational only.
    pub database_name: Option<String>,
    /// Allow-listed engine settings passed through to the driver.
    pub engine_settings: BTreeMap<String, String>,
}

impl std::fmt::Debug for DataSourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceConfig")
            .field("path", &self.path)
            .field("has_secret_token", &!self.secret_token.is_empty())
            .field("init_sql_len", &self.init_sql.len())
            .field("database_name", &self.database_name)
            .field("engine_settings", &self.engine_settings.keys())
            .finish()
    }
}

impl DataSourceConfig {
    /// Resolve settings JSON and secret JSON into a validated configuration.
    ///
    /// Unknown keys are ignored. Fails when the path is wrapped in quotes or when
    /// a MotherDuck path is configured without a token.
    pub fn resolve(raw: &JsonValue, secrets: &JsonValue) -> DbResult<Self> {
        let settings = as_object(raw, "settings")?;
        let secret_settings = as_object(secrets, "secure settings")?;

        let raw_path = string_field(settings, "path").unwrap_or_default();
        let mut path = raw_path.trim().to_string();

        if is_quoted(&path) {
            return Err(DbError::config(
                format!("path {} must not be wrapped in quotes", path),
                VALID_PATH_EXAMPLE,
            ));
        }

        if path == MEMORY_PATH_ALIAS {
            path.clear();
        }

        let secret_token = string_field(secret_settings, "motherDuckToken")
            .map(|t| t.trim().to_string())
            .unwrap_or_default();

        if path.starts_with(REMOTE_CATALOG_PREFIX) && secret_token.is_empty() {
            return Err(DbError::config(
                format!("path {} requires a MotherDuck token", path),
                "set the MotherDuck token in the secure settings",
            ));
        }

        let init_sql = string_field(secret_settings, "initSql")
            .or_else(|| string_field(settings, "initSql"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        let database_name = string_field(settings, "databaseName")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let engine_settings = settings
            .into_iter()
            .flat_map(|map| map.iter())
            .filter(|(key, _)| ALLOWED_SETTINGS.contains(&key.as_str()))
            .filter_map(|(key, value)| setting_value(value).map(|v| (key.clone(), v)))
            .collect();

        Ok(Self {
            path,
            secret_token,
            init_sql,
            database_name,
            engine_settings,
        })
    }

    /// True when the path addresses a MotherDuck catalog.
    pub fn is_remote_catalog(&self) -> bool {
        self.path.starts_with(REMOTE_CATALOG_PREFIX)
    }

    /// True when the target is an in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.path.is_empty()
    }

    /// True when the target is a file on the local filesystem.
    pub fn is_local_file(&self) -> bool {
        !(self.is_remote_catalog() || self.is_in_memory())
    }

    /// Human-readable description of the target (no secrets).
    pub fn target_description(&self) -> String {
        if self.is_in_memory() {
            "in-memory database".to_string()
        } else if self.is_remote_catalog() {
            format!("MotherDuck catalog {}", self.path)
        } else {
            format!("database file {}", self.path)
        }
    }
}

fn as_object<'a>(
    value: &'a JsonValue,
    what: &str,
) -> DbResult<Option<&'a serde_json::Map<String, JsonValue>>> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::Object(map) => Ok(Some(map)),
        other => Err(DbError::config(
            format!("{} must be a JSON object, got {}", what, json_kind(other)),
            r#"{"path": "/var/lib/grafana/data/analytics.duckdb"}"#,
        )),
    }
}

fn string_field(map: Option<&serde_json::Map<String, JsonValue>>, key: &str) -> Option<String> {
    map.and_then(|m| m.get(key))
        .and_then(JsonValue::as_str)
        .map(String::from)
}

fn setting_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_quoted(path: &str) -> bool {
    path.len() >= 2
        && ((path.starts_with('"') && path.ends_with('"'))
            || (path.starts_with('\'') && path.ends_with('\'')))
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Transport mode for the data source server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TransportMode {
    /// Newline-delimited JSON over standard input/output
    #[default]
    Stdio,
    /// JSON over HTTP
    Http,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Process configuration for the DuckDB data source server.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "duckdb-datasource",
    about = "Query data source backed by embedded DuckDB and MotherDuck",
    version,
    author
)]
pub struct Config {
    /// JSON file with default data source settings
    /// (`{"jsonData": {...}, "secureJsonData": {...}}`).
    #[arg(short, long, value_name = "FILE", env = "DUCKDB_DS_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Transport mode (stdio or http)
    #[arg(
        short,
        long,
        value_enum,
        default_value = "stdio",
        env = "DUCKDB_DS_TRANSPORT"
    )]
    pub transport: TransportMode,

    /// HTTP host to bind to (only used with http transport)
    #[arg(long, default_value = DEFAULT_HTTP_HOST, env = "DUCKDB_DS_HTTP_HOST")]
    pub http_host: String,

    /// HTTP port to bind to (only used with http transport)
    #[arg(long, default_value_t = DEFAULT_HTTP_PORT, env = "DUCKDB_DS_HTTP_PORT")]
    pub http_port: u16,

    /// Per-query timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_QUERY_TIMEOUT_SECS,
        env = "DUCKDB_DS_QUERY_TIMEOUT"
    )]
    pub query_timeout: u64,

    /// Base directory for DuckDB home, extension and secret directories
    #[arg(long, value_name = "DIR", env = DATA_DIR_ENV)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DUCKDB_DS_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DUCKDB_DS_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            settings: None,
            transport: TransportMode::Stdio,
            http_host: DEFAULT_HTTP_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            query_timeout: DEFAULT_QUERY_TIMEOUT_SECS,
            data_dir: None,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Get the HTTP bind address.
    pub fn http_bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    /// Get the query timeout as a Duration.
    pub fn query_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolve(raw: JsonValue, secrets: JsonValue) -> DbResult<DataSourceConfig> {
        DataSourceConfig::resolve(&raw, &secrets)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport, TransportMode::Stdio);
        assert_eq!(config.http_bind_addr(), "127.0.0.1:8080");
        assert_eq!(config.query_timeout_duration(), Duration::from_secs(30));
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_resolve_trims_path() {
        let config = resolve(json!({"path": "  /tmp/a.duckdb \n"}), JsonValue::Null).unwrap();
        assert_eq!(config.path, "/tmp/a.duckdb");
        assert!(config.is_local_file());
    }

    #[test]
    fn test_resolve_rejects_single_quoted_path() {
        let err = resolve(json!({"path": "'bad_path'"}), JsonValue::Null).unwrap_err();
        assert!(matches!(err, DbError::Config { .. }));
        let text = err.to_string();
        assert!(text.contains("'bad_path'"));
        assert!(text.contains("Example"));
    }

    #[test]
    fn test_resolve_rejects_double_quoted_path() {
        let err = resolve(json!({"path": " \"/data/x.db\" "}), JsonValue::Null).unwrap_err();
        assert!(matches!(err, DbError::Config { .. }));
    }

    #[test]
    fn test_resolve_accepts_unbalanced_quote() {
        let config = resolve(json!({"path": "it's.duckdb"}), JsonValue::Null).unwrap();
        assert_eq!(config.path, "it's.duckdb");
        let config = resolve(json!({"path": "'"}), JsonValue::Null).unwrap();
        assert_eq!(config.path, "'");
    }

    #[test]
    fn test_resolve_empty_path_is_in_memory() {
        let config = resolve(json!({"path": ""}), JsonValue::Null).unwrap();
        assert!(config.is_in_memory());
        assert!(!config.is_local_file());

        let config = resolve(json!({}), JsonValue::Null).unwrap();
        assert!(config.is_in_memory());

        let config = resolve(JsonValue::Null, JsonValue::Null).unwrap();
        assert!(config.is_in_memory());
    }

    #[test]
    fn test_resolve_memory_alias() {
        let config = resolve(json!({"path": ":memory:"}), JsonValue::Null).unwrap();
        assert!(config.is_in_memory());
    }

    #[test]
    fn test_resolve_remote_catalog_requires_token() {
        let err = resolve(json!({"path": "md:my_db"}), JsonValue::Null).unwrap_err();
        assert!(matches!(err, DbError::Config { .. }));
        assert!(err.to_string().contains("token"));

        let err = resolve(json!({"path": "md:my_db"}), json!({"motherDuckToken": "  "}))
            .unwrap_err();
        assert!(matches!(err, DbError::Config { .. }));
    }

    #[test]
    fn test_resolve_remote_catalog_with_token() {
        let config = resolve(json!({"path": "md:my_db"}), json!({"motherDuckToken": "tok"}))
            .unwrap();
        assert!(config.is_remote_catalog());
        assert!(!config.is_local_file());
        assert_eq!(config.secret_token, "tok");
    }

    #[test]
    fn test_resolve_init_sql_prefers_secret() {
        let config = resolve(
            json!({"initSql": "SET threads=1"}),
            json!({"initSql": "SET threads=2"}),
        )
        .unwrap();
        assert_eq!(config.init_sql, "SET threads=2");

        let config = resolve(json!({"initSql": " SET threads=1 "}), json!({})).unwrap();
        assert_eq!(config.init_sql, "SET threads=1");
    }

    #[test]
    fn test_resolve_ignores_unknown_keys_and_collects_allowed_settings() {
        let config = resolve(
            json!({
                "path": "",
                "threads": 4,
                "memory_limit": "1GB",
                "preserve_insertion_order": false,
                "someUnknownKey": "x",
                "timeInterval": "1m"
            }),
            JsonValue::Null,
        )
        .unwrap();
        assert_eq!(config.engine_settings.len(), 3);
        assert_eq!(config.engine_settings["threads"], "4");
        assert_eq!(config.engine_settings["memory_limit"], "1GB");
        assert_eq!(config.engine_settings["preserve_insertion_order"], "false");
    }

    #[test]
    fn test_resolve_rejects_non_object_settings() {
        let err = resolve(json!("path"), JsonValue::Null).unwrap_err();
        assert!(matches!(err, DbError::Config { .. }));
    }

    #[test]
    fn test_debug_hides_token() {
        let config = resolve(json!({"path": "md:"}), json!({"motherDuckToken": "secret-xyz"}))
            .unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("secret-xyz"));
        assert!(debug.contains("has_secret_token: true"));
    }

    #[test]
    fn test_target_description() {
        let config = resolve(json!({"path": "/tmp/x.db"}), JsonValue::Null).unwrap();
        assert_eq!(config.target_description(), "database file /tmp/x.db");
    }
}
