//! Storage backend configuration, built in code or from scoped environment
//! variables.

use std::path::PathBuf;

use crate::StorageError;

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub allow_http: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub virtual_hosted_style: bool,
}

impl S3Config {
    /// Read `{scope}_S3_*` plus the shared `AWS_*` credentials.
    ///
    /// Fails when `{scope}_S3_BUCKET` is unset.
    pub fn from_env(scope: &str) -> Result<Self, StorageError> {
        let env = Scope(scope);
        let bucket = env.get("S3_BUCKET").ok_or_else(|| {
            StorageError::InvalidConfig(format!(
                "{} is required for s3 backend",
                env.var("S3_BUCKET")
            ))
        })?;
        let endpoint = env.get("S3_ENDPOINT");
        // Plain-http endpoints (MinIO) are allowed unless told otherwise.
        let allow_http = env.flag("S3_ALLOW_HTTP")?.unwrap_or_else(|| {
            endpoint
                .as_deref()
                .is_some_and(|e| e.trim_start().to_ascii_lowercase().starts_with("http://"))
        });

        Ok(Self {
            bucket,
            region: env_non_empty("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            endpoint,
            allow_http,
            access_key_id: env_non_empty("AWS_ACCESS_KEY_ID"),
            secret_access_key: env_non_empty("AWS_SECRET_ACCESS_KEY"),
            session_token: env_non_empty("AWS_SESSION_TOKEN"),
            virtual_hosted_style: env.flag("S3_VIRTUAL_HOSTED_STYLE")?.unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone)]
pub enum StorageBackendConfig {
    S3(S3Config),
    Filesystem { root: PathBuf },
    Memory,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackendConfig,
    /// Optional key prefix applied to all object keys.
    pub prefix: Option<String>,
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::with_backend(StorageBackendConfig::Memory)
    }

    pub fn filesystem(root: impl Into<PathBuf>) -> Self {
        Self::with_backend(StorageBackendConfig::Filesystem { root: root.into() })
    }

    pub fn s3(cfg: S3Config) -> Self {
        Self::with_backend(StorageBackendConfig::S3(cfg))
    }

    fn with_backend(backend: StorageBackendConfig) -> Self {
        Self {
            backend,
            prefix: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = non_empty(prefix.into());
        self
    }

    /// Build a config from environment variables under `scope`.
    ///
    /// Artifacts and datasets read separate scopes so they can live in
    /// different places. With `scope = "ARTIFACT"`:
    ///
    /// - `ARTIFACT_STORAGE_BACKEND`: `s3`, `filesystem` or `memory`; `default`
    ///   when unset
    /// - `ARTIFACT_STORAGE_FS_ROOT`: required for `filesystem` unless `default`
    ///   already names a root
    /// - `ARTIFACT_STORAGE_PREFIX`: optional key prefix
    /// - `ARTIFACT_S3_BUCKET`, `ARTIFACT_S3_ENDPOINT`, `ARTIFACT_S3_ALLOW_HTTP`,
    ///   `ARTIFACT_S3_VIRTUAL_HOSTED_STYLE` for `s3`, see [`S3Config::from_env`]
    pub fn from_env_scoped(scope: &str, default: StorageConfig) -> Result<Self, StorageError> {
        let env = Scope(scope);
        let fs_root = env.get("STORAGE_FS_ROOT").map(PathBuf::from);

        let cfg = match env.get("STORAGE_BACKEND").as_deref() {
            Some("s3") => Self::s3(S3Config::from_env(scope)?),
            Some("filesystem" | "fs") => match (fs_root, default.backend) {
                (Some(root), _) | (None, StorageBackendConfig::Filesystem { root }) => {
                    Self::filesystem(root)
                }
                (None, _) => {
                    return Err(StorageError::InvalidConfig(format!(
                        "{} is required for the filesystem backend",
                        env.var("STORAGE_FS_ROOT")
                    )));
                }
            },
            Some("memory" | "mem") => Self::memory(),
            Some(other) => {
                return Err(StorageError::InvalidConfig(format!(
                    "unsupported {}={other} (expected s3|filesystem|memory)",
                    env.var("STORAGE_BACKEND")
                )));
            }
            None => fs_root.map(Self::filesystem).unwrap_or(default),
        };

        Ok(match env.get("STORAGE_PREFIX") {
            Some(prefix) => cfg.with_prefix(prefix),
            None => cfg,
        })
    }
}

/// Variables of one store, named `{scope}_{name}`.
struct Scope<'a>(&'a str);

impl Scope<'_> {
    fn var(&self, name: &str) -> String {
        format!("{}_{}", self.0, name)
    }

    fn get(&self, name: &str) -> Option<String> {
        env_non_empty(&self.var(name))
    }

    fn flag(&self, name: &str) -> Result<Option<bool>, StorageError> {
        let var = self.var(name);
        let Some(raw) = env_non_empty(&var) else {
            return Ok(None);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" => Ok(Some(true)),
            "0" | "false" | "no" | "n" => Ok(Some(false)),
            _ => Err(StorageError::InvalidConfig(format!(
                "invalid boolean for {var}={raw} (expected true/false)"
            ))),
        }
    }
}

pub(crate) fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(non_empty)
}
