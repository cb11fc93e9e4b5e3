//! Error types for the DuckDB data source.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Configuration and connection errors are fatal to the operation that raised them;
//! query, conversion, timeout and cancellation errors are isolated to a single
//! query slot in a batch response.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid configuration: {message}. Example of a valid value: {example}")]
    Config { message: String, example: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Query failed: {message}")]
    Database { message: String, suggestion: String },

    #[error("Conversion failed for column '{column}' ({type_name}): {message}")]
    Conversion {
        column: String,
        type_name: String,
        message: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Canceled: {operation}")]
    Canceled { operation: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error with an example of valid input.
    pub fn config(message: impl Into<String>, example: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            example: example.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a query execution error.
    pub fn database(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a value conversion error.
    pub fn conversion(
        column: impl Into<String>,
        type_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Conversion {
            column: column.into(),
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create a cancellation error.
    pub fn canceled(operation: impl Into<String>) -> Self {
        Self::Canceled {
            operation: operation.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::Config { example, .. } => Some(example),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Bootstrap statements are idempotent, so a failed connect may be retried
    /// from scratch. Configuration errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if this error is a caller cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }
}

/// Convert DuckDB driver errors to DbError.
impl From<duckdb::Error> for DbError {
    fn from(err: duckdb::Error) -> Self {
        let message = err.to_string();
        let lower = message.to_lowercase();

        let suggestion = if lower.contains("parser error") || lower.contains("syntax") {
            "Check the SQL syntax"
        } else if lower.contains("catalog error") {
            "Check that the referenced tables, columns and functions exist"
        } else if lower.contains("conversion error") {
            "Check the types of the values used in the query"
        } else if lower.contains("io error") {
            "Check that the database file exists and is readable"
        } else {
            "Check the SQL statement and the database state"
        };

        DbError::database(message, suggestion)
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::invalid_input(format!("Malformed JSON: {}", err))
    }
}

/// Result type alias for data source operations.
pub type DbResult<T> = Result<T, DbError>;
