use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

const CONFIG_DIR_ENV: &str = "INBOXCLAW_CONFIG_DIR";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level inboxclaw configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Language model endpoint (`[provider]`).
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Orchestration loop settings (`[agent]`).
    #[serde(default)]
    pub agent: AgentConfig,

    /// Confirmation gate and mutating-tool policy (`[confirmation]`).
    #[serde(default)]
    pub confirmation: ConfirmationConfig,

    /// Tool server launch settings (`[tool_server]`).
    #[serde(default)]
    pub tool_server: ToolServerConfig,

    /// Google OAuth client for the Gmail server (`[oauth]`).
    #[serde(default)]
    pub oauth: OAuthConfig,
}

// ── Provider ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// API key. Overridden by `OPENAI_API_KEY` or `INBOXCLAW_API_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Base URL of an OpenAI-compatible API. Default: `https://api.openai.com/v1`.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Default: `gpt-4o-mini`.
    #[serde(default = "default_model")]
    pub model: String,
    /// Sampling temperature (0.0–2.0). Default: `0.0`.
    #[serde(default)]
    pub temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// HTTP timeout for one completion request. Default: `120`.
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}

fn default_provider_timeout_secs() -> u64 {
    120
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_api_url(),
            model: default_model(),
            temperature: 0.0,
            max_tokens: None,
            timeout_secs: default_provider_timeout_secs(),
        }
    }
}

// ── Agent ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum model round-trips per user message. Default: `10`.
    /// Setting to `0` falls back to the safe default of `10`.
    #[serde(default = "default_agent_max_tool_iterations")]
    pub max_tool_iterations: usize,
    /// Replaces the built-in assistant instructions. The tool list is still appended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_agent_max_tool_iterations() -> usize {
    10
}

impl AgentConfig {
    pub fn effective_max_tool_iterations(&self) -> usize {
        if self.max_tool_iterations == 0 {
            default_agent_max_tool_iterations()
        } else {
            self.max_tool_iterations
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_agent_max_tool_iterations(),
            system_prompt: None,
        }
    }
}

// ── Confirmation ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    /// Replies that confirm a pending action. Matched after trimming and lowercasing.
    #[serde(default = "default_affirmative")]
    pub affirmative: Vec<String>,
    /// Substrings of a tool name that mark it as mutating (case-insensitive).
    #[serde(default = "default_mutating_keywords")]
    pub mutating_keywords: Vec<String>,
    /// Tools that always need confirmation, whatever their name.
    #[serde(default)]
    pub always_ask: Vec<String>,
    /// Tools exempt from the keyword match, e.g. `list_senders`.
    /// `destructiveHint` and `always_ask` still apply.
    #[serde(default)]
    pub never_ask: Vec<String>,
}

fn default_affirmative() -> Vec<String> {
    ["yes", "y", "send", "confirm"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_mutating_keywords() -> Vec<String> {
    vec!["send".into(), "reply".into()]
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            affirmative: default_affirmative(),
            mutating_keywords: default_mutating_keywords(),
            always_ask: Vec::new(),
            never_ask: Vec::new(),
        }
    }
}

// ── Tool server ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolServerPreset {
    /// IMAP/SMTP server: `email-client` on stdio.
    EmailClient,
    /// Gmail API server: `npx -y @gongrzhe/server-gmail-autoauth-mcp`.
    #[default]
    GmailAutoauth,
    /// Anything else; `command` is required.
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    #[serde(default)]
    pub preset: ToolServerPreset,
    /// Overrides the preset's command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Overrides the preset's arguments when non-empty.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the server process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Only `stdio` is supported.
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
}

fn default_transport() -> String {
    "stdio".into()
}

fn default_init_timeout_secs() -> u64 {
    30
}

fn default_rpc_timeout_secs() -> u64 {
    60
}

impl Default for ToolServerConfig {
    fn default() -> Self {
        Self {
            preset: ToolServerPreset::default(),
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            transport: default_transport(),
            init_timeout_secs: default_init_timeout_secs(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
        }
    }
}

// ── OAuth ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Overridden by `GOOGLE_CLIENT_ID`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Overridden by `GOOGLE_CLIENT_SECRET`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Overridden by `GOOGLE_PROJECT_ID`. Default: `gmail-assistant`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Default: `~/.gmail-mcp/gcp-oauth.keys.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys_path: Option<PathBuf>,
    /// Default: `~/.gmail-mcp/credentials.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<PathBuf>,
}

impl OAuthConfig {
    pub fn effective_project_id(&self) -> &str {
        self.project_id
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or("gmail-assistant")
    }

    pub fn effective_keys_path(&self) -> Result<PathBuf> {
        match &self.keys_path {
            Some(path) => Ok(path.clone()),
            None => Ok(gmail_mcp_dir()?.join("gcp-oauth.keys.json")),
        }
    }

    pub fn effective_credentials_path(&self) -> Result<PathBuf> {
        match &self.credentials_path {
            Some(path) => Ok(path.clone()),
            None => Ok(gmail_mcp_dir()?.join("credentials.json")),
        }
    }
}

fn home_dir() -> Result<PathBuf> {
    UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")
}

fn gmail_mcp_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(".gmail-mcp"))
}

fn default_config_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(".inboxclaw"))
}

// ── Loading ──────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());

        Self {
            config_path: home.join(".inboxclaw").join("config.toml"),
            provider: ProviderConfig::default(),
            agent: AgentConfig::default(),
            confirmation: ConfirmationConfig::default(),
            tool_server: ToolServerConfig::default(),
            oauth: OAuthConfig::default(),
        }
    }
}

impl Config {
    /// Load `config.toml` from the resolved config directory, creating it with
    /// defaults on first run. Env overrides are applied and the result validated.
    ///
    /// Directory precedence: `config_dir` argument, `INBOXCLAW_CONFIG_DIR`,
    /// then `~/.inboxclaw`.
    pub async fn load_or_init(config_dir: Option<&Path>) -> Result<Self> {
        let dir = match config_dir {
            Some(dir) => dir.to_path_buf(),
            None => match std::env::var(CONFIG_DIR_ENV) {
                Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
                _ => default_config_dir()?,
            },
        };

        let mut config = Self::load_from_dir(&dir).await?;
        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            model = %config.provider.model,
            preset = ?config.tool_server.preset,
            "Config loaded"
        );
        Ok(config)
    }

    /// Read `<dir>/config.toml`, or write defaults there if it does not exist.
    /// Does not apply env overrides.
    pub async fn load_from_dir(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.toml");

        if config_path.exists() {
            // Warn if config file is world-readable (may contain API keys)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}). \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }

            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            Ok(config)
        } else {
            let config = Config {
                config_path: config_path.clone(),
                ..Config::default()
            };
            config.save().await?;

            // Restrict permissions on newly created config file (may contain API keys)
            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }

            tracing::info!(path = %config_path.display(), "Wrote default config");
            Ok(config)
        }
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        // Provider
        if self.provider.model.trim().is_empty() {
            anyhow::bail!("provider.model must not be empty");
        }
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            anyhow::bail!(
                "provider.temperature must be between 0.0 and 2.0 (got {})",
                self.provider.temperature
            );
        }
        if self.provider.api_url.trim().is_empty() {
            anyhow::bail!("provider.api_url must not be empty");
        }

        // Tool server
        if !self.tool_server.transport.eq_ignore_ascii_case("stdio") {
            anyhow::bail!(
                "tool_server.transport `{}` is not supported; only `stdio` is",
                self.tool_server.transport
            );
        }
        if self.tool_server.preset == ToolServerPreset::Custom
            && self
                .tool_server
                .command
                .as_deref()
                .is_none_or(|c| c.trim().is_empty())
        {
            anyhow::bail!("tool_server.command is required when preset = \"custom\"");
        }

        // Confirmation
        if self
            .confirmation
            .affirmative
            .iter()
            .all(|w| w.trim().is_empty())
        {
            anyhow::bail!("confirmation.affirmative must contain at least one word");
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Same as [`Self::apply_env_overrides`] with an injectable lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        // API Key: INBOXCLAW_API_KEY wins over OPENAI_API_KEY
        if let Some(key) = non_empty("INBOXCLAW_API_KEY").or_else(|| non_empty("OPENAI_API_KEY")) {
            self.provider.api_key = Some(key);
        }
        if let Some(url) = non_empty("INBOXCLAW_API_URL") {
            self.provider.api_url = url;
        }
        if let Some(model) = non_empty("INBOXCLAW_MODEL") {
            self.provider.model = model;
        }
        if let Some(temp) = non_empty("INBOXCLAW_TEMPERATURE") {
            match temp.trim().parse::<f64>() {
                Ok(value) if (0.0..=2.0).contains(&value) => self.provider.temperature = value,
                _ => tracing::warn!(value = %temp, "Ignoring invalid INBOXCLAW_TEMPERATURE"),
            }
        }

        if let Some(id) = non_empty("GOOGLE_CLIENT_ID") {
            self.oauth.client_id = Some(id);
        }
        if let Some(secret) = non_empty("GOOGLE_CLIENT_SECRET") {
            self.oauth.client_secret = Some(secret);
        }
        if let Some(project) = non_empty("GOOGLE_PROJECT_ID") {
            self.oauth.project_id = Some(project);
        }
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        fs::write(&temp_path, toml_str.as_bytes())
            .await
            .with_context(|| {
                format!(
                    "Failed to write temporary config file: {}",
                    temp_path.display()
                )
            })?;

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ── Defaults ─────────────────────────────────────────────

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.provider.model, "gpt-4o-mini");
        assert_eq!(config.provider.temperature, 0.0);
        assert_eq!(config.agent.max_tool_iterations, 10);
        assert_eq!(
            config.confirmation.affirmative,
            vec!["yes", "y", "send", "confirm"]
        );
        assert_eq!(config.confirmation.mutating_keywords, vec!["send", "reply"]);
        assert_eq!(config.tool_server.preset, ToolServerPreset::GmailAutoauth);
        assert_eq!(config.tool_server.transport, "stdio");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_max_tool_iterations_falls_back_to_ten() {
        let agent = AgentConfig {
            max_tool_iterations: 0,
            system_prompt: None,
        };
        assert_eq!(agent.effective_max_tool_iterations(), 10);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [provider]
            model = "gpt-4o"

            [tool_server]
            preset = "email-client"
            "#,
        )
        .unwrap();
        assert_eq!(config.provider.model, "gpt-4o");
        assert_eq!(config.provider.api_url, "https://api.openai.com/v1");
        assert_eq!(config.tool_server.preset, ToolServerPreset::EmailClient);
        assert_eq!(config.tool_server.rpc_timeout_secs, 60);
        assert_eq!(config.confirmation.affirmative.len(), 4);
    }

    // ── validate ─────────────────────────────────────────────

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = Config::default();
        config.provider.model = "  ".into();
        assert!(config.validate().unwrap_err().to_string().contains("model"));

        let mut config = Config::default();
        config.provider.temperature = 2.5;
        assert!(config.validate().unwrap_err().to_string().contains("temperature"));

        let mut config = Config::default();
        config.tool_server.transport = "sse".into();
        assert!(config.validate().unwrap_err().to_string().contains("transport"));

        let mut config = Config::default();
        config.tool_server.preset = ToolServerPreset::Custom;
        assert!(config.validate().unwrap_err().to_string().contains("command"));

        let mut config = Config::default();
        config.confirmation.affirmative = vec![" ".into()];
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("affirmative"));
    }

    #[test]
    fn custom_preset_with_command_is_valid() {
        let mut config = Config::default();
        config.tool_server.preset = ToolServerPreset::Custom;
        config.tool_server.command = Some("my-mail-server".into());
        assert!(config.validate().is_ok());
    }

    // ── env overrides ────────────────────────────────────────

    #[test]
    fn env_overrides_apply_and_prefer_inboxclaw_key() {
        let mut config = Config::default();
        config.apply_overrides_from(lookup_from(&[
            ("OPENAI_API_KEY", "sk-openai"),
            ("INBOXCLAW_API_KEY", "sk-inbox"),
            ("INBOXCLAW_MODEL", "gpt-4o"),
            ("INBOXCLAW_TEMPERATURE", "0.3"),
            ("GOOGLE_CLIENT_ID", "id.apps.googleusercontent.com"),
            ("GOOGLE_CLIENT_SECRET", "secret"),
        ]));
        assert_eq!(config.provider.api_key.as_deref(), Some("sk-inbox"));
        assert_eq!(config.provider.model, "gpt-4o");
        assert_eq!(config.provider.temperature, 0.3);
        assert_eq!(
            config.oauth.client_id.as_deref(),
            Some("id.apps.googleusercontent.com")
        );
        assert_eq!(config.oauth.effective_project_id(), "gmail-assistant");
    }

    #[test]
    fn empty_and_invalid_env_values_are_ignored() {
        let mut config = Config::default();
        config.provider.api_key = Some("from-file".into());
        config.apply_overrides_from(lookup_from(&[
            ("OPENAI_API_KEY", ""),
            ("INBOXCLAW_TEMPERATURE", "hot"),
        ]));
        assert_eq!(config.provider.api_key.as_deref(), Some("from-file"));
        assert_eq!(config.provider.temperature, 0.0);
    }

    // ── persistence ──────────────────────────────────────────

    #[tokio::test]
    async fn first_load_writes_defaults_then_reads_them_back() {
        let tmp = tempfile::tempdir().unwrap();
        let first = Config::load_from_dir(tmp.path()).await.unwrap();
        assert!(first.config_path.exists());

        let second = Config::load_from_dir(tmp.path()).await.unwrap();
        assert_eq!(second.provider.model, first.provider.model);
        assert_eq!(second.config_path, tmp.path().join("config.toml"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn new_config_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_from_dir(tmp.path()).await.unwrap();
        let mode = std::fs::metadata(&config.config_path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
