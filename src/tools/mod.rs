//! Mailbox tools, provided by an external MCP server.
//!
//! The session only sees the [`ToolGateway`] trait. [`McpGateway`] implements
//! it over a stdio child process; [`server_spec`] turns the `[tool_server]`
//! config section (and its presets) into a launch description.

pub mod gateway;
pub mod mcp_client;
pub mod mcp_protocol;
pub mod traits;

pub use gateway::{McpGateway, ToolGateway};
pub use mcp_client::{McpClient, StdioServerSpec};
pub use traits::{ToolCallRequest, ToolResult, ToolSpec};

use crate::config::{ToolServerConfig, ToolServerPreset};
use std::collections::BTreeMap;
use std::time::Duration;

/// Mailbox credentials forwarded to the `email-client` server.
pub const EMAIL_ENV_VARS: [&str; 5] = [
    "EMAIL_ADDRESS",
    "EMAIL_PASSWORD",
    "IMAP_SERVER",
    "SMTP_SERVER",
    "SMTP_PORT",
];

/// npm package of the Gmail API server.
pub const GMAIL_MCP_PACKAGE: &str = "@gongrzhe/server-gmail-autoauth-mcp";

/// `npx`, resolved on PATH when possible (`npx.cmd` on Windows).
pub fn npx_command() -> String {
    let name = if cfg!(windows) { "npx.cmd" } else { "npx" };
    match which::which(name) {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(_) => name.to_string(),
    }
}

/// Launch description for the configured tool server.
///
/// `lookup` reads the host environment; it is injectable so presets can be
/// checked without touching process state.
pub fn server_spec(
    config: &ToolServerConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> StdioServerSpec {
    let (name, preset_command, preset_args, mut env) = match config.preset {
        ToolServerPreset::EmailClient => {
            let env: BTreeMap<String, String> = EMAIL_ENV_VARS
                .iter()
                .filter_map(|key| lookup(key).map(|value| ((*key).to_string(), value)))
                .collect();
            ("email-client", "email-client".to_string(), Vec::new(), env)
        }
        ToolServerPreset::GmailAutoauth => (
            "gmail",
            npx_command(),
            vec!["-y".to_string(), GMAIL_MCP_PACKAGE.to_string()],
            BTreeMap::new(),
        ),
        ToolServerPreset::Custom => ("custom", String::new(), Vec::new(), BTreeMap::new()),
    };

    env.extend(config.env.clone());

    StdioServerSpec {
        name: name.to_string(),
        command: config
            .command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(preset_command),
        args: if config.args.is_empty() {
            preset_args
        } else {
            config.args.clone()
        },
        env,
        init_timeout: Duration::from_secs(config.init_timeout_secs),
        rpc_timeout: Duration::from_secs(config.rpc_timeout_secs),
    }
}
