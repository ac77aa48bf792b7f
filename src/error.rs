//! Error taxonomy for startup and per-turn failures.
//!
//! Startup errors ([`ConfigurationError`], [`ToolDiscoveryError`]) are fatal and
//! carry a remediation hint for the console. Per-turn errors
//! ([`ToolInvocationError`], [`ModelError`]) are recovered by the session and
//! reported inline.

use std::fmt;

/// Missing or invalid configuration, detected before the chat loop starts.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ConfigurationError {
    pub message: String,
    pub hint: Option<String>,
}

impl ConfigurationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// The tool provider could not be reached or exposes an unusable tool set.
#[derive(Debug, thiserror::Error)]
pub enum ToolDiscoveryError {
    #[error("tool server unreachable: {0}")]
    Unreachable(String),
    #[error("tool server started but exposed no tools")]
    NoTools,
    #[error("tool server exposes `{0}` more than once")]
    DuplicateName(String),
}

impl ToolDiscoveryError {
    pub fn hint(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => {
                "Check tool_server.command in config.toml and that the binary is on PATH."
            }
            Self::NoTools => {
                "Double-check your mailbox credentials and that IMAP/the Gmail API is enabled."
            }
            Self::DuplicateName(_) => "The tool server is misconfigured; tool names must be unique.",
        }
    }
}

/// Why a single tool call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFailure {
    /// The request never got a well-formed answer (pipe closed, bad JSON, ...).
    Transport(String),
    /// No answer within the configured RPC timeout.
    Timeout(u64),
    /// The tool server answered with an error.
    Provider(String),
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Timeout(secs) => write!(f, "timed out after {secs}s"),
            Self::Provider(msg) => write!(f, "{msg}"),
        }
    }
}

/// A specific tool call failed. Recovered per turn.
#[derive(Debug, Clone, thiserror::Error)]
#[error("tool `{name}` failed: {cause}")]
pub struct ToolInvocationError {
    pub name: String,
    pub cause: ToolFailure,
}

impl ToolInvocationError {
    pub fn new(name: impl Into<String>, cause: ToolFailure) -> Self {
        Self {
            name: name.into(),
            cause,
        }
    }
}

/// The language model call failed. Retried once, then reported inline.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("language model timed out after {0}s")]
    Timeout(u64),
    #[error("language model request failed: {0}")]
    Request(String),
    #[error("language model returned an unusable response: {0}")]
    InvalidResponse(String),
}
