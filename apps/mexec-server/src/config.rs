use std::{net::SocketAddr, path::PathBuf, time::Duration};

use tracing::info;

pub const DEFAULT_NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
pub const DEFAULT_WORKSPACE_LABEL: &str = "che.workspace_id";
pub const DEFAULT_OWNER_ANNOTATION: &str = "org.eclipse.che.workspace/user";
const DEFAULT_DIRECTORY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_OUTPUT_REPLAY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("invalid MEXEC_HTTP_MAX_CONC: {0}")]
    InvalidConcurrency(String),
    #[error("invalid MEXEC_PORT: {0}")]
    InvalidPort(String),
    #[error("invalid MEXEC_BIND: {0}")]
    InvalidBind(String),
    #[error("invalid boolean for {key}: {value}")]
    InvalidBool { key: &'static str, value: String },
    #[error("invalid MEXEC_DIRECTORY_TIMEOUT_SECS: {0}")]
    InvalidTimeout(String),
    #[error("invalid MEXEC_OUTPUT_REPLAY: {0}")]
    InvalidReplay(String),
}

#[derive(Clone, Debug)]
pub(crate) struct ServerConfig {
    pub addr: SocketAddr,
    pub concurrency_limit: usize,
    /// Require the forwarded access token on admission and per RPC call.
    pub use_bearer_token: bool,
    pub namespace_file: PathBuf,
    pub workspace_id: Option<String>,
    pub workspace_label: String,
    pub owner_annotation: String,
    pub directory_timeout: Duration,
    pub output_replay: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 4444)),
            concurrency_limit: 1024,
            use_bearer_token: false,
            namespace_file: PathBuf::from(DEFAULT_NAMESPACE_FILE),
            workspace_id: None,
            workspace_label: DEFAULT_WORKSPACE_LABEL.into(),
            owner_annotation: DEFAULT_OWNER_ANNOTATION.into(),
            directory_timeout: Duration::from_secs(DEFAULT_DIRECTORY_TIMEOUT_SECS),
            output_replay: DEFAULT_OUTPUT_REPLAY,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let concurrency_limit = env_nonempty("MEXEC_HTTP_MAX_CONC")
            .map(|raw| {
                raw.parse()
                    .map_err(|_| ConfigError::InvalidConcurrency(raw))
            })
            .transpose()? // Option<Result> -> Result<Option>
            .unwrap_or(defaults.concurrency_limit);

        let bind = env_nonempty("MEXEC_BIND").unwrap_or_else(|| "0.0.0.0".into());
        let port_raw = env_nonempty("MEXEC_PORT").unwrap_or_else(|| "4444".into());
        let port: u16 = port_raw
            .parse()
            .map_err(|_| ConfigError::InvalidPort(port_raw))?;
        let addr = format!("{}:{}", bind, port)
            .parse()
            .map_err(|_| ConfigError::InvalidBind(bind.clone()))?;

        let use_bearer_token = env_bool("MEXEC_USE_BEARER_TOKEN")?.unwrap_or(false);

        let directory_timeout = env_nonempty("MEXEC_DIRECTORY_TIMEOUT_SECS")
            .map(|raw| match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
                _ => Err(ConfigError::InvalidTimeout(raw)),
            })
            .transpose()?
            .unwrap_or(defaults.directory_timeout);

        let output_replay = env_nonempty("MEXEC_OUTPUT_REPLAY")
            .map(|raw| raw.parse().map_err(|_| ConfigError::InvalidReplay(raw)))
            .transpose()?
            .unwrap_or(defaults.output_replay);

        Ok(Self {
            addr,
            concurrency_limit,
            use_bearer_token,
            namespace_file: env_nonempty("MEXEC_NAMESPACE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.namespace_file),
            workspace_id: env_nonempty("MEXEC_WORKSPACE_ID"),
            workspace_label: env_nonempty("MEXEC_WORKSPACE_LABEL")
                .unwrap_or(defaults.workspace_label),
            owner_annotation: env_nonempty("MEXEC_OWNER_ANNOTATION")
                .unwrap_or(defaults.owner_annotation),
            directory_timeout,
            output_replay,
        })
    }

    pub fn log_summary(&self) {
        info!(
            addr = %self.addr,
            concurrency_limit = self.concurrency_limit,
            use_bearer_token = self.use_bearer_token,
            namespace_file = %self.namespace_file.display(),
            workspace_id = self.workspace_id.as_deref().unwrap_or("<unset>"),
            workspace_label = %self.workspace_label,
            owner_annotation = %self.owner_annotation,
            directory_timeout_secs = self.directory_timeout.as_secs(),
            output_replay = self.output_replay,
            "effective configuration"
        );
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(key: &'static str) -> Result<Option<bool>, ConfigError> {
    let Some(value) = env_nonempty(key) else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidBool { key, value }),
    }
}
