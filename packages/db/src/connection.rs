//! Database connection management.

use dispatch_core::OrchestratorError;
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect as connect_any};
use surrealdb::opt::auth::Root;
use thiserror::Error;

/// Database connection wrapper.
///
/// Cheap to clone; clones share the underlying connection.
pub type Database = Surreal<Any>;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Connection mode: "mem://", "rocksdb://path" or "ws://host:port"
    pub endpoint: String,
    /// Namespace to use
    pub namespace: String,
    /// Database name to use
    pub database: String,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "dispatch".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }
}

impl DbConfig {
    /// Create a config for in-memory testing.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Build a config from environment variables.
    ///
    /// - `DISPATCH_DB_ENDPOINT` (default: `mem://`)
    /// - `DISPATCH_DB_NAMESPACE` (default: `dispatch`)
    /// - `DISPATCH_DB_DATABASE` (default: `main`)
    /// - `DISPATCH_DB_USER` / `DISPATCH_DB_PASSWORD` (optional, both required to sign in)
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(endpoint) = env_non_empty("DISPATCH_DB_ENDPOINT") {
            cfg.endpoint = endpoint;
        }
        if let Some(namespace) = env_non_empty("DISPATCH_DB_NAMESPACE") {
            cfg.namespace = namespace;
        }
        if let Some(database) = env_non_empty("DISPATCH_DB_DATABASE") {
            cfg.database = database;
        }
        if let (Some(user), Some(password)) = (
            env_non_empty("DISPATCH_DB_USER"),
            env_non_empty("DISPATCH_DB_PASSWORD"),
        ) {
            cfg.credentials = Some((user, password));
        }
        cfg
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(#[from] surrealdb::Error),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<DbError> for OrchestratorError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Connection(e) => OrchestratorError::Transport(e.to_string()),
            DbError::Query(msg) => OrchestratorError::Transport(msg),
            DbError::NotFound(msg) => OrchestratorError::NotFound(msg),
            DbError::Conflict(msg) => OrchestratorError::Conflict(msg),
            DbError::Serialization(msg) => OrchestratorError::Fatal(msg),
        }
    }
}

/// Open a connection and select the namespace and database.
pub async fn connect(config: &DbConfig) -> Result<Database, DbError> {
    tracing::info!("Connecting to database: {}", config.endpoint);

    let db = connect_any(config.endpoint.as_str()).await?;

    // Authenticate if credentials provided
    if let Some((username, password)) = &config.credentials {
        db.signin(Root { username, password }).await?;
    }

    // Select namespace and database
    db.use_ns(&config.namespace).use_db(&config.database).await?;

    tracing::info!(
        "Connected to database: {}/{}",
        config.namespace,
        config.database
    );

    Ok(db)
}
