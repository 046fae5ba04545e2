use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::service::DEFAULT_MATCH_THRESHOLD;
use crate::store::StoreBackend;

const CONFIG_FILE_ENV: &str = "FACEGATE_CONFIG";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_EXTRACTION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime configuration shared by the daemon and the CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Address the HTTP daemon listens on.
    pub bind_addr: SocketAddr,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    pub store_backend: StoreBackend,
    pub store_path: PathBuf,
    /// Maximum Euclidean descriptor distance accepted as a match.
    pub match_threshold: f32,
    /// Upper bound on a single descriptor extraction.
    pub extraction_timeout: Duration,
    pub max_upload_bytes: usize,
    /// Load models at startup instead of on first use.
    pub preload_models: bool,
}

/// Optional TOML overlay; every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub bind_addr: Option<SocketAddr>,
    pub model_dir: Option<PathBuf>,
    pub store_backend: Option<StoreBackend>,
    pub store_path: Option<PathBuf>,
    pub match_threshold: Option<f32>,
    pub extraction_timeout_secs: Option<u64>,
    pub max_upload_bytes: Option<usize>,
    pub preload_models: Option<bool>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Config {
    /// Defaults, overlaid by the TOML file named in `FACEGATE_CONFIG` (if
    /// set), overlaid by `FACEGATE_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) if !path.trim().is_empty() => FileConfig::from_path(Path::new(&path))?,
            _ => FileConfig::default(),
        };
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup.
    pub fn from_sources(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let default_bind: SocketAddr = DEFAULT_BIND_ADDR
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("default bind address: {e}")))?;

        let store_backend = env_parse(&env, "FACEGATE_STORE_BACKEND")
            .or(file.store_backend)
            .unwrap_or_default();

        let store_path = env("FACEGATE_STORE_PATH")
            .map(PathBuf::from)
            .or(file.store_path)
            .unwrap_or_else(|| data_dir.join(store_backend.default_file_name()));

        let model_dir = env("FACEGATE_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| data_dir.join("models"));

        let timeout_secs = env_parse(&env, "FACEGATE_EXTRACTION_TIMEOUT_SECS")
            .or(file.extraction_timeout_secs)
            .unwrap_or(DEFAULT_EXTRACTION_TIMEOUT_SECS);

        let config = Self {
            bind_addr: env_parse(&env, "FACEGATE_BIND_ADDR")
                .or(file.bind_addr)
                .unwrap_or(default_bind),
            model_dir,
            store_backend,
            store_path,
            match_threshold: env_parse(&env, "FACEGATE_MATCH_THRESHOLD")
                .or(file.match_threshold)
                .unwrap_or(DEFAULT_MATCH_THRESHOLD),
            extraction_timeout: Duration::from_secs(timeout_secs),
            max_upload_bytes: env_parse(&env, "FACEGATE_MAX_UPLOAD_BYTES")
                .or(file.max_upload_bytes)
                .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            preload_models: env("FACEGATE_PRELOAD_MODELS")
                .map(|v| v.trim() != "0")
                .or(file.preload_models)
                .unwrap_or(true),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.match_threshold.is_finite() || self.match_threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be a positive number, got {}",
                self.match_threshold
            )));
        }
        if self.extraction_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "extraction_timeout_secs must be at least 1".into(),
            ));
        }
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid("max_upload_bytes must be non-zero".into()));
        }
        Ok(())
    }
}

/// Parse an environment value, warning and ignoring it when malformed.
fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}
