use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LlmBackend {
    #[default]
    Openai,
    Anthropic,
}

impl LlmBackend {
    pub fn to_string(&self) -> &str {
        match self {
            LlmBackend::Openai => "openai",
            LlmBackend::Anthropic => "anthropic",
        }
    }
}

/// Tunables for the supervisor, read from a TOML file.
///
/// Every key is optional; a missing key takes its default. A missing file is
/// created with the defaults by [`SupervisorConfig::load_or_create`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Seconds to wait for a new crash artifact before shutting down.
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout: u64,
    /// Transport-level retries for each LLM request.
    #[serde(default)]
    pub llm_max_retries: u32,
    /// Patch/rebuild/reverify cycles per crash artifact.
    #[serde(default = "default_num_tries_to_fix")]
    pub num_tries_to_fix: u32,
    /// Seconds to sleep after every fix request.
    #[serde(default = "default_llm_timeout")]
    pub llm_timeout: u64,
    #[serde(default)]
    pub llm_backend: LlmBackend,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_endpoint: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_launch_grace_ms")]
    pub launch_grace_ms: u64,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,
}

pub fn default_queue_timeout() -> u64 {
    7200
}

pub fn default_num_tries_to_fix() -> u32 {
    10
}

pub fn default_llm_timeout() -> u64 {
    60
}

pub fn default_llm_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_launch_grace_ms() -> u64 {
    100
}

fn default_logs_dir() -> String {
    "logs".to_string()
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            queue_timeout: default_queue_timeout(),
            llm_max_retries: 0,
            num_tries_to_fix: default_num_tries_to_fix(),
            llm_timeout: default_llm_timeout(),
            llm_backend: LlmBackend::default(),
            llm_model: default_llm_model(),
            llm_endpoint: None,
            poll_interval_ms: default_poll_interval_ms(),
            launch_grace_ms: default_launch_grace_ms(),
            logs_dir: default_logs_dir(),
        }
    }
}

impl SupervisorConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: SupervisorConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Loads the configuration at `path`, writing the defaults there first if
    /// the file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, anyhow::Error> {
        if path.exists() {
            return Self::load_from_file(path);
        }

        let config = SupervisorConfig::default();
        let rendered = toml::to_string_pretty(&config)
            .map_err(|e| anyhow::anyhow!("Failed to render default config: {}", e))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, rendered).map_err(|e| {
            anyhow::anyhow!("Failed to write default config file at {:?}: {}", path, e)
        })?;
        tracing::info!(?path, "created configuration file with defaults");
        Ok(config)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout)
    }

    pub fn llm_delay(&self) -> Duration {
        Duration::from_secs(self.llm_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn launch_grace(&self) -> Duration {
        Duration::from_millis(self.launch_grace_ms)
    }
}
