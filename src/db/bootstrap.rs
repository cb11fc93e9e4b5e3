//! One-time connection bootstrapping.
//!
//! A freshly opened pool must have its storage directories configured, the
//! MotherDuck extension installed and loaded, the catalog attached and the user
//! init SQL applied before any query runs. The sequence is built once per pool
//! and executed by the first connection handed out; [`BootstrapGuard`] makes
//! every other caller wait for it instead of running it again.

use crate::config::{DataSourceConfig, REMOTE_CATALOG_PREFIX};
use crate::db::driver::Connection;
use crate::error::{DbError, DbResult};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// What a bootstrap statement does. Used for logging instead of the SQL text,
/// which may carry the catalog token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    HomeDirectory,
    ExtensionDirectory,
    SecretDirectory,
    InstallExtension,
    LoadExtension,
    SetToken,
    AttachCatalog,
    InitSql,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HomeDirectory => "home_directory",
            Self::ExtensionDirectory => "extension_directory",
            Self::SecretDirectory => "secret_directory",
            Self::InstallExtension => "install_extension",
            Self::LoadExtension => "load_extension",
            Self::SetToken => "set_token",
            Self::AttachCatalog => "attach_catalog",
            Self::InitSql => "init_sql",
        }
    }
}

/// One administrative statement of the bootstrap sequence.
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapStatement {
    pub kind: StatementKind,
    pub sql: String,
}

impl std::fmt::Debug for BootstrapStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the token.
        let sql = if self.kind == StatementKind::SetToken {
            "SET motherduck_token='***'"
        } else {
            &self.sql
        };
        f.debug_struct("BootstrapStatement")
            .field("kind", &self.kind)
            .field("sql", &sql)
            .finish()
    }
}

impl BootstrapStatement {
    fn new(kind: StatementKind, sql: impl Into<String>) -> Self {
        Self {
            kind,
            sql: sql.into(),
        }
    }
}

/// Quote a value as a SQL string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Physical connection target for a configuration.
///
/// In-memory and MotherDuck targets both open an in-memory database; the catalog
/// is attached afterwards by the bootstrap sequence.
pub fn connection_target(config: &DataSourceConfig) -> &str {
    if config.is_in_memory() || config.is_remote_catalog() {
        ""
    } else {
        &config.path
    }
}

/// Build the administrative statement sequence for a configuration.
///
/// `data_dir` is the deployment-wide data directory; when absent, no storage
/// directories are configured.
pub fn build_statements(
    config: &DataSourceConfig,
    data_dir: Option<&Path>,
) -> Vec<BootstrapStatement> {
    let mut statements = Vec::new();

    if let Some(dir) = data_dir {
        let dir = dir.to_string_lossy();
        statements.push(BootstrapStatement::new(
            StatementKind::HomeDirectory,
            format!("SET home_directory={}", quote_literal(&dir)),
        ));
        statements.push(BootstrapStatement::new(
            StatementKind::ExtensionDirectory,
            format!(
                "SET extension_directory={}",
                quote_literal(&format!("{}/.duckdb/extensions", dir))
            ),
        ));
        statements.push(BootstrapStatement::new(
            StatementKind::SecretDirectory,
            format!(
                "SET secret_directory={}",
                quote_literal(&format!("{}/.duckdb/stored_secrets", dir))
            ),
        ));
    }

    if config.path.starts_with(REMOTE_CATALOG_PREFIX) || !config.secret_token.is_empty() {
        statements.push(BootstrapStatement::new(
            StatementKind::InstallExtension,
            "INSTALL motherduck",
        ));
        statements.push(BootstrapStatement::new(
            StatementKind::LoadExtension,
            "LOAD motherduck",
        ));
        statements.push(BootstrapStatement::new(
            StatementKind::SetToken,
            format!("SET motherduck_token={}", quote_literal(&config.secret_token)),
        ));
        if config.is_remote_catalog() {
            statements.push(BootstrapStatement::new(
                StatementKind::AttachCatalog,
                format!("ATTACH IF NOT EXISTS {}", quote_literal(&config.path)),
            ));
        }
    }

    if !config.init_sql.is_empty() {
        statements.push(BootstrapStatement::new(
            StatementKind::InitSql,
            config.init_sql.clone(),
        ));
    }

    statements
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Runs the bootstrap sequence at most once per pool.
///
/// The state lock is held across the check and the whole statement sequence, so
/// concurrent first callers block until the winner finishes and then observe
/// `Ready`. A failed run resets the state to `Uninitialized`; the next caller
/// starts over.
#[derive(Debug)]
pub struct BootstrapGuard {
    statements: Vec<BootstrapStatement>,
    state: Mutex<BootstrapState>,
}

impl BootstrapGuard {
    pub fn new(statements: Vec<BootstrapStatement>) -> Self {
        Self {
            statements,
            state: Mutex::new(BootstrapState::Uninitialized),
        }
    }

    pub fn state(&self) -> BootstrapState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn statements(&self) -> &[BootstrapStatement] {
        &self.statements
    }

    /// Ensure the sequence has run, running it against `conn` if nobody has yet.
    pub fn ensure(&self, conn: &dyn Connection) -> DbResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| DbError::internal("bootstrap state lock poisoned"))?;

        if *state == BootstrapState::Ready {
            return Ok(());
        }

        *state = BootstrapState::Initializing;
        debug!(statements = self.statements.len(), "Running bootstrap sequence");

        for statement in &self.statements {
            if let Err(e) = conn.execute(&statement.sql) {
                *state = BootstrapState::Uninitialized;
                warn!(
                    statement = statement.kind.as_str(),
                    error = %e,
                    "Bootstrap statement failed"
                );
                return Err(DbError::connection(
                    format!("bootstrap step {} failed: {}", statement.kind.as_str(), e),
                    suggestion_for(statement.kind),
                ));
            }
        }

        *state = BootstrapState::Ready;
        info!(statements = self.statements.len(), "Bootstrap sequence complete");
        Ok(())
    }
}

fn suggestion_for(kind: StatementKind) -> &'static str {
    match kind {
        StatementKind::HomeDirectory
        | StatementKind::ExtensionDirectory
        | StatementKind::SecretDirectory => "Check that the data directory exists and is writable",
        StatementKind::InstallExtension | StatementKind::LoadExtension => {
            "Check network access to the extension repository or preinstall the extension"
        }
        StatementKind::SetToken | StatementKind::AttachCatalog => {
            "Check the MotherDuck token and the catalog name in the path"
        }
        StatementKind::InitSql => "Check the init SQL of the data source",
    }
}
