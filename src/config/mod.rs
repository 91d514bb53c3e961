use crate::utils::{ensure_dir, get_oxiclaw_home};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Transport (WhatsApp Business Cloud API) credentials and webhook settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default, rename = "accessToken")]
    pub access_token: String,
    #[serde(default, rename = "phoneNumberId")]
    pub phone_number_id: String,
    /// Token echoed back during the webhook verification handshake.
    #[serde(default, rename = "verifyToken")]
    pub verify_token: String,
    /// Shared secret for X-Hub-Signature-256 validation. Empty disables the check.
    #[serde(default, rename = "webhookSecret")]
    pub webhook_secret: String,
    #[serde(default = "default_webhook_port", rename = "webhookPort")]
    pub webhook_port: u16,
    #[serde(default = "default_api_base", rename = "apiBase")]
    pub api_base: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            phone_number_id: String::new(),
            verify_token: String::new(),
            webhook_secret: String::new(),
            webhook_port: default_webhook_port(),
            api_base: default_api_base(),
        }
    }
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field(
                "access_token",
                &if self.access_token.is_empty() {
                    "[empty]"
                } else {
                    "[REDACTED]"
                },
            )
            .field("phone_number_id", &self.phone_number_id)
            .field(
                "webhook_secret",
                &if self.webhook_secret.is_empty() {
                    "[empty]"
                } else {
                    "[REDACTED]"
                },
            )
            .field("webhook_port", &self.webhook_port)
            .field("api_base", &self.api_base)
            .finish()
    }
}

fn default_webhook_port() -> u16 {
    8477
}

fn default_api_base() -> String {
    "https://graph.facebook.com/v21.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container runtime binary, e.g. "docker" or "podman".
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_container_timeout", rename = "timeoutSecs")]
    pub timeout_secs: u64,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_max_output", rename = "maxOutputBytes")]
    pub max_output_bytes: usize,
    /// Host environment variables forwarded into the sandbox (agent
    /// credentials).
    #[serde(default = "default_env_passthrough", rename = "envPassthrough")]
    pub env_passthrough: Vec<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            image: default_image(),
            timeout_secs: default_container_timeout(),
            memory: default_memory(),
            max_output_bytes: default_max_output(),
            env_passthrough: default_env_passthrough(),
        }
    }
}

fn default_env_passthrough() -> Vec<String> {
    vec!["ANTHROPIC_API_KEY".to_string()]
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "oxiclaw-agent:latest".to_string()
}

fn default_container_timeout() -> u64 {
    300
}

fn default_memory() -> String {
    "2g".to_string()
}

fn default_max_output() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    /// OpenAI-compatible embeddings endpoint. Empty disables semantic search.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_http_timeout", rename = "timeoutSecs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: default_embedding_model(),
            timeout_secs: default_http_timeout(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_http_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_github_bin", rename = "githubBin")]
    pub github_bin: String,
    #[serde(default = "default_sugar_bin", rename = "sugarBin")]
    pub sugar_bin: String,
    /// Binary that prints a video transcript to stdout given a URL.
    #[serde(default = "default_transcript_bin", rename = "transcriptBin")]
    pub transcript_bin: String,
    #[serde(default = "default_cli_timeout", rename = "cliTimeoutSecs")]
    pub cli_timeout_secs: u64,
    #[serde(default = "default_transcript_timeout", rename = "transcriptTimeoutSecs")]
    pub transcript_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            github_bin: default_github_bin(),
            sugar_bin: default_sugar_bin(),
            transcript_bin: default_transcript_bin(),
            cli_timeout_secs: default_cli_timeout(),
            transcript_timeout_secs: default_transcript_timeout(),
        }
    }
}

fn default_github_bin() -> String {
    "gh".to_string()
}

fn default_sugar_bin() -> String {
    "sugar".to_string()
}

fn default_transcript_bin() -> String {
    "yt-dlp-transcript".to_string()
}

fn default_cli_timeout() -> u64 {
    30
}

fn default_transcript_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Display name the assistant replies under (and the reply prefix).
    #[serde(default = "default_assistant_name", rename = "assistantName")]
    pub assistant_name: String,
    /// IANA timezone used for cron schedules.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Host path mounted read-write into the `main` group's container.
    #[serde(default = "default_project_root", rename = "projectRoot")]
    pub project_root: PathBuf,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            assistant_name: default_assistant_name(),
            timezone: default_timezone(),
            project_root: default_project_root(),
            transport: TransportConfig::default(),
            container: ContainerConfig::default(),
            embeddings: EmbeddingsConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

fn default_assistant_name() -> String {
    "Alfred".to_string()
}

fn default_timezone() -> String {
    crate::scheduler::detect_system_timezone().unwrap_or_else(|| "UTC".to_string())
}

fn default_project_root() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.assistant_name.trim().is_empty() {
            anyhow::bail!("assistantName must not be empty");
        }
        if self.container.timeout_secs == 0 {
            anyhow::bail!("container.timeoutSecs must be positive");
        }
        if self.container.max_output_bytes == 0 {
            anyhow::bail!("container.maxOutputBytes must be positive");
        }
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            anyhow::bail!("timezone '{}' is not a valid IANA timezone", self.timezone);
        }
        Ok(())
    }
}

/// Resolved filesystem layout rooted at the oxiclaw home directory.
#[derive(Debug, Clone)]
pub struct Paths {
    pub home: PathBuf,
}

impl Paths {
    pub fn new(home: PathBuf) -> Self {
        Self { home }
    }

    pub fn store_db(&self) -> PathBuf {
        self.home.join("store").join("oxiclaw.db")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }

    pub fn registered_groups_file(&self) -> PathBuf {
        self.data_dir().join("registered_groups.json")
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.data_dir().join("sessions.json")
    }

    pub fn router_state_file(&self) -> PathBuf {
        self.data_dir().join("router_state.json")
    }

    pub fn projects_file(&self) -> PathBuf {
        self.data_dir().join("sugar-projects.json")
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.data_dir().join("ipc")
    }

    pub fn ipc_group_dir(&self, folder: &str) -> PathBuf {
        self.ipc_dir().join(folder)
    }

    pub fn ipc_errors_dir(&self) -> PathBuf {
        self.ipc_dir().join("errors")
    }

    pub fn groups_dir(&self) -> PathBuf {
        self.home.join("groups")
    }

    pub fn group_dir(&self, folder: &str) -> PathBuf {
        self.groups_dir().join(folder)
    }

    pub fn group_logs_dir(&self, folder: &str) -> PathBuf {
        self.group_dir(folder).join("logs")
    }

    /// Mount allowlist lives under the user config dir, outside the project
    /// root, and is never itself mounted into any sandbox.
    pub fn mount_allowlist_file(&self) -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| self.home.clone())
            .join("oxiclaw")
            .join("mount-allowlist.json")
    }

    pub fn ensure_layout(&self) -> Result<()> {
        ensure_dir(&self.home)?;
        ensure_dir(self.home.join("store"))?;
        ensure_dir(self.data_dir())?;
        ensure_dir(self.ipc_dir())?;
        ensure_dir(self.ipc_errors_dir())?;
        ensure_dir(self.groups_dir())?;
        Ok(())
    }
}

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_oxiclaw_home()?.join("config.json"))
}

pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let default_path = get_config_path().unwrap_or_else(|_| PathBuf::from("config.json"));
    let path = config_path.unwrap_or(default_path.as_path());

    let mut config = if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON from {}", path.display()))?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);

    config
        .validate()
        .with_context(|| "Configuration validation failed")?;
    Ok(config)
}

/// Secrets come from the environment in preference to config.json.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(token) = std::env::var("OXICLAW_WA_ACCESS_TOKEN") {
        config.transport.access_token = token;
    }
    if let Ok(id) = std::env::var("OXICLAW_WA_PHONE_ID") {
        config.transport.phone_number_id = id;
    }
    if let Ok(token) = std::env::var("OXICLAW_WA_VERIFY_TOKEN") {
        config.transport.verify_token = token;
    }
    if let Ok(secret) = std::env::var("OXICLAW_WA_WEBHOOK_SECRET") {
        config.transport.webhook_secret = secret;
    }
    if let Ok(endpoint) = std::env::var("OXICLAW_EMBEDDINGS_ENDPOINT") {
        config.embeddings.endpoint = endpoint;
    }
}
