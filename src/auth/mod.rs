//! Startup credential checks and the Gmail OAuth bootstrap.
//!
//! Everything here runs before the chat loop. Failures are
//! [`ConfigurationError`]s with a console hint; nothing is retried.

use crate::config::{Config, OAuthConfig, ToolServerPreset};
use crate::error::ConfigurationError;
use crate::tools::{npx_command, EMAIL_ENV_VARS, GMAIL_MCP_PACKAGE};
use serde::Serialize;
use std::path::{Path, PathBuf};

const GOOGLE_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_CERTS_URL: &str = "https://www.googleapis.com/oauth2/v1/certs";
const REDIRECT_URI: &str = "http://localhost";

/// Google's "installed application" client file, as read by the Gmail server.
#[derive(Debug, Serialize)]
struct InstalledClientFile<'a> {
    installed: InstalledClient<'a>,
}

#[derive(Debug, Serialize)]
struct InstalledClient<'a> {
    client_id: &'a str,
    project_id: &'a str,
    auth_uri: &'a str,
    token_uri: &'a str,
    auth_provider_x509_cert_url: &'a str,
    client_secret: &'a str,
    redirect_uris: [&'a str; 1],
}

/// What the bootstrap did, for the `auth` command's output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub keys_written: Option<PathBuf>,
    pub authorized: bool,
}

/// Credential checks bound to one loaded config.
pub struct AuthService<'a> {
    config: &'a Config,
}

impl<'a> AuthService<'a> {
    pub fn from_config(config: &'a Config) -> Self {
        Self { config }
    }

    /// Fails fast when the model API key is absent.
    pub fn check_provider(&self) -> Result<(), ConfigurationError> {
        let present = self
            .config
            .provider
            .api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty());
        if present {
            Ok(())
        } else {
            Err(ConfigurationError::new("No model API key configured").with_hint(
                "Set OPENAI_API_KEY in a .env file or provider.api_key in config.toml.",
            ))
        }
    }

    /// Prepares whatever the configured tool server needs to start.
    pub async fn prepare_tool_server(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<BootstrapReport, ConfigurationError> {
        match self.config.tool_server.preset {
            ToolServerPreset::EmailClient => {
                check_mailbox_env(&self.config.tool_server.env, lookup)?;
                Ok(BootstrapReport::default())
            }
            ToolServerPreset::GmailAutoauth => {
                let oauth = &self.config.oauth;
                let keys_path = oauth.effective_keys_path().map_err(path_error)?;
                let credentials_path = oauth.effective_credentials_path().map_err(path_error)?;

                let keys_written = if write_oauth_keys(oauth, &keys_path)? {
                    Some(keys_path)
                } else {
                    None
                };

                let authorized = if credentials_path.exists() {
                    false
                } else {
                    let args = ["-y".to_string(), GMAIL_MCP_PACKAGE.to_string(), "auth".to_string()];
                    run_auth_flow(&npx_command(), &args, &credentials_path).await?;
                    true
                };

                Ok(BootstrapReport {
                    keys_written,
                    authorized,
                })
            }
            ToolServerPreset::Custom => Ok(BootstrapReport::default()),
        }
    }
}

fn path_error(err: anyhow::Error) -> ConfigurationError {
    ConfigurationError::new(format!("Cannot resolve OAuth file location: {err}"))
        .with_hint("Set oauth.keys_path and oauth.credentials_path in config.toml.")
}

/// Every mailbox variable must come from the host or `[tool_server.env]`.
pub fn check_mailbox_env(
    configured: &std::collections::BTreeMap<String, String>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigurationError> {
    let missing: Vec<&str> = EMAIL_ENV_VARS
        .iter()
        .copied()
        .filter(|key| {
            let from_host = lookup(key).is_some_and(|v| !v.trim().is_empty());
            let from_config = configured.get(*key).is_some_and(|v| !v.trim().is_empty());
            !from_host && !from_config
        })
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigurationError::new(format!(
            "Missing mailbox settings: {}",
            missing.join(", ")
        ))
        .with_hint("Add them to your .env file or to [tool_server.env] in config.toml."))
    }
}

/// Writes the OAuth client file when absent. Returns whether it was written.
pub fn write_oauth_keys(oauth: &OAuthConfig, path: &Path) -> Result<bool, ConfigurationError> {
    if path.exists() {
        return Ok(false);
    }

    let client_id = non_empty(oauth.client_id.as_deref());
    let client_secret = non_empty(oauth.client_secret.as_deref());
    let (Some(client_id), Some(client_secret)) = (client_id, client_secret) else {
        return Err(ConfigurationError::new(format!(
            "OAuth client file {} is missing and no client credentials are configured",
            path.display()
        ))
        .with_hint("Set GOOGLE_CLIENT_ID and GOOGLE_CLIENT_SECRET in your .env file."));
    };

    let file = InstalledClientFile {
        installed: InstalledClient {
            client_id,
            project_id: oauth.effective_project_id(),
            auth_uri: GOOGLE_AUTH_URI,
            token_uri: GOOGLE_TOKEN_URI,
            auth_provider_x509_cert_url: GOOGLE_CERTS_URL,
            client_secret,
            redirect_uris: [REDIRECT_URI],
        },
    };

    let write = || -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    };
    write().map_err(|e| {
        ConfigurationError::new(format!("Failed to write {}: {e}", path.display()))
    })?;

    tracing::info!(path = %path.display(), "Wrote OAuth client file");
    Ok(true)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Runs the interactive browser authorization and checks it left credentials behind.
pub async fn run_auth_flow(
    command: &str,
    args: &[String],
    credentials_path: &Path,
) -> Result<(), ConfigurationError> {
    tracing::info!(command, "Starting Gmail authorization");

    let status = tokio::process::Command::new(command)
        .args(args)
        .status()
        .await
        .map_err(|e| {
            ConfigurationError::new(format!("Could not run `{command}`: {e}"))
                .with_hint("Install Node.js so that npx is on PATH.")
        })?;

    if !status.success() {
        return Err(ConfigurationError::new(format!(
            "Gmail authorization exited with {status}"
        ))
        .with_hint("Re-run `inboxclaw auth` and complete the consent screen in the browser."));
    }

    if !credentials_path.exists() {
        return Err(ConfigurationError::new(format!(
            "Authorization finished but {} was not created",
            credentials_path.display()
        ))
        .with_hint("Check that the OAuth client allows the http://localhost redirect."));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn oauth_with(dir: &Path) -> OAuthConfig {
        OAuthConfig {
            client_id: Some("client-123.apps.googleusercontent.com".into()),
            client_secret: Some("GOCSPX-secret".into()),
            project_id: None,
            keys_path: Some(dir.join("keys").join("gcp-oauth.keys.json")),
            credentials_path: Some(dir.join("credentials.json")),
        }
    }

    #[test]
    fn missing_api_key_is_reported_with_env_hint() {
        let mut config = Config::default();
        config.provider.api_key = Some("   ".into());
        let err = AuthService::from_config(&config).check_provider().unwrap_err();
        assert!(err.hint.unwrap().contains("OPENAI_API_KEY"));

        config.provider.api_key = Some("sk-test".into());
        assert!(AuthService::from_config(&config).check_provider().is_ok());
    }

    #[test]
    fn mailbox_check_lists_every_missing_variable() {
        let err = check_mailbox_env(&BTreeMap::new(), |key| {
            (key == "EMAIL_ADDRESS").then(|| "me@example.com".to_string())
        })
        .unwrap_err();
        assert!(!err.message.contains("EMAIL_ADDRESS"));
        assert!(err.message.contains("EMAIL_PASSWORD"));
        assert!(err.message.contains("SMTP_PORT"));
    }

    #[test]
    fn mailbox_check_accepts_configured_values() {
        let configured: BTreeMap<String, String> = EMAIL_ENV_VARS
            .iter()
            .map(|key| ((*key).to_string(), "x".to_string()))
            .collect();
        assert!(check_mailbox_env(&configured, |_| None).is_ok());
    }

    #[test]
    fn keys_file_uses_installed_client_format() {
        let tmp = tempfile::tempdir().unwrap();
        let oauth = oauth_with(tmp.path());
        let path = oauth.keys_path.clone().unwrap();

        assert!(write_oauth_keys(&oauth, &path).unwrap());

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let installed = &written["installed"];
        assert_eq!(installed["client_id"], "client-123.apps.googleusercontent.com");
        assert_eq!(installed["client_secret"], "GOCSPX-secret");
        assert_eq!(installed["project_id"], "gmail-assistant");
        assert_eq!(installed["token_uri"], GOOGLE_TOKEN_URI);
        assert_eq!(installed["redirect_uris"][0], "http://localhost");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn existing_keys_file_is_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gcp-oauth.keys.json");
        std::fs::write(&path, "{\"installed\":{}}").unwrap();

        let oauth = OAuthConfig::default();
        assert!(!write_oauth_keys(&oauth, &path).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"installed\":{}}");
    }

    #[test]
    fn keys_file_requires_client_credentials() {
        let tmp = tempfile::tempdir().unwrap();
        let oauth = OAuthConfig {
            client_id: Some("id".into()),
            ..OAuthConfig::default()
        };
        let err = write_oauth_keys(&oauth, &tmp.path().join("keys.json")).unwrap_err();
        assert!(err.hint.unwrap().contains("GOOGLE_CLIENT_SECRET"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_auth_command_is_a_configuration_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = run_auth_flow("false", &[], &tmp.path().join("credentials.json"))
            .await
            .unwrap_err();
        assert!(err.message.contains("exited"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_auth_without_credentials_file_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = run_auth_flow("true", &[], &tmp.path().join("credentials.json"))
            .await
            .unwrap_err();
        assert!(err.message.contains("was not created"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn auth_flow_accepts_written_credentials() {
        let tmp = tempfile::tempdir().unwrap();
        let creds = tmp.path().join("credentials.json");
        let args = vec!["-c".to_string(), format!("echo '{{}}' > '{}'", creds.display())];
        run_auth_flow("sh", &args, &creds).await.unwrap();
        assert!(creds.exists());
    }

    #[tokio::test]
    async fn gmail_preset_skips_auth_when_credentials_exist() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.oauth = oauth_with(tmp.path());
        std::fs::write(tmp.path().join("credentials.json"), "{}").unwrap();

        let report = AuthService::from_config(&config)
            .prepare_tool_server(|_| None)
            .await
            .unwrap();
        assert!(!report.authorized);
        assert_eq!(report.keys_written, config.oauth.keys_path.clone());
    }

    #[tokio::test]
    async fn custom_preset_needs_no_bootstrap() {
        let mut config = Config::default();
        config.tool_server.preset = ToolServerPreset::Custom;
        let report = AuthService::from_config(&config)
            .prepare_tool_server(|_| None)
            .await
            .unwrap();
        assert_eq!(report, BootstrapReport::default());
    }
}
