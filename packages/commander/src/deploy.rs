//! Deployment modes and backend assembly.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use actors::{Backends, ChannelQueue};
use db::{BrokerConfig, DbConfig, DbError, MemoryStateStore, SurrealQueue, SurrealStateStore};
use dispatch_core::{ConfigError, OrchestratorConfig};
use storage::{ArtifactStorage, DatasetStorage, S3Config, Storage, StorageConfig, StorageError};

/// Errors that stop the process before it accepts work.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("invalid value for {name}: {value} (expected {expected})")]
    InvalidValue {
        name: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("deployment mode '{0}' is not implemented")]
    Unsupported(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Environment(String),
}

/// Which backend combination to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    /// One process: channel queue, in-memory state and artifacts, datasets on disk.
    Standalone,
    /// Shared SurrealDB queue and state, object storage for artifacts and datasets.
    Container,
    /// Recognised but not implemented.
    Cluster,
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::Standalone => "standalone",
            DeploymentMode::Container => "container",
            DeploymentMode::Cluster => "cluster",
        }
    }
}

impl FromStr for DeploymentMode {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standalone" => Ok(DeploymentMode::Standalone),
            "container" => Ok(DeploymentMode::Container),
            "cluster" => Ok(DeploymentMode::Cluster),
            _ => Err(BootstrapError::InvalidValue {
                name: "DISPATCH_MODE",
                value: s.to_string(),
                expected: "standalone, container, cluster",
            }),
        }
    }
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a process does in a container deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accept and dispatch jobs only.
    Commander,
    /// Run worker units only.
    Agent,
    /// Both.
    All,
}

impl Role {
    pub fn runs_commander(&self) -> bool {
        matches!(self, Role::Commander | Role::All)
    }

    pub fn runs_pool(&self) -> bool {
        matches!(self, Role::Agent | Role::All)
    }
}

impl FromStr for Role {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "commander" => Ok(Role::Commander),
            "agent" => Ok(Role::Agent),
            "all" => Ok(Role::All),
            _ => Err(BootstrapError::InvalidValue {
                name: "DISPATCH_ROLE",
                value: s.to_string(),
                expected: "commander, agent, all",
            }),
        }
    }
}

/// Everything needed to assemble a process.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub mode: DeploymentMode,
    pub role: Role,
    pub config: OrchestratorConfig,
    /// Dataset directory for standalone mode.
    pub dataset_root: Option<PathBuf>,
}

impl Deployment {
    /// Standalone deployment reading datasets from `dataset_root`.
    pub fn standalone(config: OrchestratorConfig, dataset_root: impl Into<PathBuf>) -> Self {
        Self {
            mode: DeploymentMode::Standalone,
            role: Role::All,
            config,
            dataset_root: Some(dataset_root.into()),
        }
    }

    /// Read `DISPATCH_MODE`, `DISPATCH_ROLE`, `DISPATCH_DATASET_ROOT` and the
    /// orchestrator config from the environment.
    pub fn from_env() -> Result<Self, BootstrapError> {
        let mode = match env_non_empty("DISPATCH_MODE") {
            Some(mode) => mode.parse()?,
            None => DeploymentMode::Standalone,
        };
        // A standalone process is always both halves.
        let role = match (mode, env_non_empty("DISPATCH_ROLE")) {
            (DeploymentMode::Standalone, _) | (_, None) => Role::All,
            (_, Some(role)) => role.parse()?,
        };
        let config = OrchestratorConfig::from_env()?;
        let dataset_root = env_non_empty("DISPATCH_DATASET_ROOT").map(PathBuf::from);

        Ok(Self {
            mode,
            role,
            config,
            dataset_root,
        })
    }
}

/// Build the backends for a deployment.
pub async fn assemble(deployment: &Deployment) -> Result<Backends, BootstrapError> {
    deployment.config.validate()?;
    match deployment.mode {
        DeploymentMode::Standalone => assemble_standalone(deployment).await,
        DeploymentMode::Container => assemble_container(deployment).await,
        DeploymentMode::Cluster => Err(BootstrapError::Unsupported(
            DeploymentMode::Cluster.to_string(),
        )),
    }
}

async fn assemble_standalone(deployment: &Deployment) -> Result<Backends, BootstrapError> {
    let config = &deployment.config;
    let dataset_root = match &deployment.dataset_root {
        Some(root) => root.clone(),
        None => {
            tracing::warn!("No dataset root provided");
            let root = default_dataset_root()?;
            tracing::info!("Using default dataset root {}", root.display());
            root
        }
    };

    let artifacts = Storage::new(StorageConfig::memory()).await?;
    let datasets = Storage::new(StorageConfig::filesystem(dataset_root)).await?;

    tracing::info!(
        "Assembled standalone backends (queue capacity {}, first job {})",
        config.queue_capacity,
        config.starting_job_id
    );
    Ok(Backends {
        queue: Arc::new(ChannelQueue::new(config.queue_capacity)),
        state: Arc::new(MemoryStateStore::new(config.starting_job_id)),
        artifacts: Arc::new(ArtifactStorage::new(artifacts)),
        datasets: Arc::new(DatasetStorage::new(datasets)),
    })
}

async fn assemble_container(deployment: &Deployment) -> Result<Backends, BootstrapError> {
    let config = &deployment.config;
    let db_config = DbConfig::from_env();
    let db = db::connect(&db_config).await?;

    let state = SurrealStateStore::new(db.clone(), config.starting_job_id).await?;
    let broker = BrokerConfig::default()
        .with_visibility_timeout(config.visibility_timeout())
        .with_poll_interval(config.poll_interval());
    let queue = SurrealQueue::new(db, broker).await?;

    let artifacts = Storage::new(container_storage("ARTIFACT")?).await?;
    let datasets = Storage::new(container_storage("DATASET")?).await?;

    tracing::info!(
        "Assembled container backends (database {}, artifacts {}, datasets {})",
        db_config.endpoint,
        artifacts.kind_str(),
        datasets.kind_str()
    );
    Ok(Backends {
        queue: Arc::new(queue),
        state: Arc::new(state),
        artifacts: Arc::new(ArtifactStorage::new(artifacts)),
        datasets: Arc::new(DatasetStorage::new(datasets)),
    })
}

/// Object storage for a container store: S3 when a bucket is configured,
/// whatever `{scope}_STORAGE_*` says otherwise.
fn container_storage(scope: &str) -> Result<StorageConfig, BootstrapError> {
    let default = match S3Config::from_env(scope) {
        Ok(s3) => StorageConfig::s3(s3),
        Err(_) => StorageConfig::memory(),
    };
    let cfg = StorageConfig::from_env_scoped(scope, default)?;
    if matches!(cfg.backend, storage::StorageBackendConfig::Memory) {
        tracing::warn!(
            "{} storage is in memory; it is not shared with other processes",
            scope.to_ascii_lowercase()
        );
    }
    Ok(cfg)
}

fn default_dataset_root() -> Result<PathBuf, BootstrapError> {
    let exe = std::env::current_exe().map_err(|e| {
        BootstrapError::Environment(format!("failed to get executable path: {e}"))
    })?;
    let dir = exe.parent().ok_or_else(|| {
        BootstrapError::Environment(format!("executable {} has no parent", exe.display()))
    })?;
    Ok(dir.join("datasets"))
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modes_and_roles() {
        assert!(matches!("Container".parse::<DeploymentMode>(), Ok(DeploymentMode::Container)));
        assert!(matches!("cluster".parse::<DeploymentMode>(), Ok(DeploymentMode::Cluster)));
        assert!(matches!(
            "swarm".parse::<DeploymentMode>(),
            Err(BootstrapError::InvalidValue { .. })
        ));

        let agent: Result<Role, _> = "agent".parse();
        assert!(matches!(agent, Ok(Role::Agent)));
        assert!(Role::All.runs_pool() && Role::All.runs_commander());
        assert!(!Role::Agent.runs_commander());
        assert!(!Role::Commander.runs_pool());
    }

    #[tokio::test]
    async fn cluster_mode_is_rejected() {
        let deployment = Deployment {
            mode: DeploymentMode::Cluster,
            role: Role::All,
            config: OrchestratorConfig::default(),
            dataset_root: None,
        };
        assert!(matches!(
            assemble(&deployment).await,
            Err(BootstrapError::Unsupported(_))
        ));
    }
}
