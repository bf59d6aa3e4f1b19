use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Project-level configuration file looked up in the project directory
pub const PROJECT_CONFIG_FILE: &str = "tfstack.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub project: ProjectConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Root of the local backend; defaults to `<data_dir>/state`
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long to wait for a held lock; 0 fails immediately
    #[serde(default = "default_lock_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_lock_timeout(),
            retry_interval_ms: default_retry_interval(),
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_stack_file")]
    pub stack_file: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    pub project_directory: Option<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            stack_file: default_stack_file(),
            data_dir: default_data_dir(),
            project_directory: None,
        }
    }
}

fn default_lock_timeout() -> u64 {
    10
}

fn default_retry_interval() -> u64 {
    250
}

fn default_stack_file() -> String {
    "stack.json".to_string()
}

fn default_data_dir() -> String {
    ".tfstack".to_string()
}

impl Config {
    /// Directory holding workspace selection and local state
    pub fn data_dir(&self, project_directory: &Path) -> PathBuf {
        project_directory.join(&self.project.data_dir)
    }

    pub fn state_dir(&self, project_directory: &Path) -> PathBuf {
        match &self.state.path {
            Some(path) => {
                let path = PathBuf::from(path);
                if path.is_absolute() {
                    path
                } else {
                    project_directory.join(path)
                }
            }
            None => self.data_dir(project_directory).join("state"),
        }
    }

    pub fn stack_path(&self, project_directory: &Path) -> PathBuf {
        project_directory.join(&self.project.stack_file)
    }
}

/// Load configuration from an explicit file
pub fn init_from_path(path: &str) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path, e))?;
    let mut config: Config = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Invalid config file {}: {}", path, e))?;
    info!("Loaded configuration from {}", path);
    apply_env_overrides(&mut config, std::env::vars());
    Ok(config)
}

/// Load configuration from the project directory or the user config directory,
/// falling back to defaults
pub fn init_default(project_directory: Option<&Path>) -> anyhow::Result<Config> {
    let candidates = project_directory
        .map(|dir| dir.join(PROJECT_CONFIG_FILE))
        .into_iter()
        .chain(dirs::config_dir().map(|dir| dir.join("tfstack").join("config.json")));

    for candidate in candidates {
        if candidate.is_file() {
            return init_from_path(&candidate.to_string_lossy());
        }
    }

    debug!("No configuration file found, using defaults");
    let mut config = Config::default();
    apply_env_overrides(&mut config, std::env::vars());
    Ok(config)
}

/// `TFSTACK_STATE_DIR`, `TFSTACK_LOCK_TIMEOUT` and `TFSTACK_DIR` beat the file
pub fn apply_env_overrides<I>(config: &mut Config, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        match key.as_str() {
            "TFSTACK_STATE_DIR" => {
                debug!("State directory overridden by TFSTACK_STATE_DIR: {}", value);
                config.state.path = Some(value);
            }
            "TFSTACK_LOCK_TIMEOUT" => match value.parse() {
                Ok(secs) => config.lock.timeout_secs = secs,
                Err(_) => tracing::warn!("Ignoring invalid TFSTACK_LOCK_TIMEOUT '{}'", value),
            },
            "TFSTACK_DIR" => config.project.project_directory = Some(value),
            _ => {}
        }
    }
}
