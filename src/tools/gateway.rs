//! The seam between the session and the external tool provider.

use super::mcp_client::{McpClient, RpcError, StdioServerSpec};
use super::traits::{ToolResult, ToolSpec};
use crate::approval::MutationPolicy;
use crate::error::{ToolDiscoveryError, ToolFailure, ToolInvocationError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;

/// Access to the mailbox tools.
///
/// `list_tools` is called once at session start; `invoke` once per executed
/// tool call. Implementations normalize every failure into the two error
/// types so the session never sees transport details.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolDiscoveryError>;

    async fn invoke(&self, name: &str, args: Value) -> Result<ToolResult, ToolInvocationError>;
}

/// [`ToolGateway`] backed by an MCP server on stdio.
pub struct McpGateway {
    client: McpClient,
    policy: MutationPolicy,
}

impl McpGateway {
    /// Launch the server and complete the MCP handshake.
    pub async fn connect(
        spec: &StdioServerSpec,
        policy: MutationPolicy,
    ) -> Result<Self, ToolDiscoveryError> {
        let client = McpClient::spawn(spec)
            .await
            .map_err(|e| ToolDiscoveryError::Unreachable(e.to_string()))?;
        tracing::info!(mcp_server = %spec.name, "Connected to tool server");
        Ok(Self::from_client(client, policy))
    }

    /// Wrap an already initialized client.
    pub fn from_client(client: McpClient, policy: MutationPolicy) -> Self {
        Self { client, policy }
    }
}

#[async_trait]
impl ToolGateway for McpGateway {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolDiscoveryError> {
        let definitions = self
            .client
            .list_tools()
            .await
            .map_err(|e| ToolDiscoveryError::Unreachable(e.to_string()))?;

        if definitions.is_empty() {
            return Err(ToolDiscoveryError::NoTools);
        }

        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(definitions.len());
        for def in definitions {
            if !seen.insert(def.name.clone()) {
                return Err(ToolDiscoveryError::DuplicateName(def.name));
            }
            let mutating = self
                .policy
                .is_mutating(&def.name, def.is_flagged_destructive());
            specs.push(ToolSpec {
                description: def.description.clone().unwrap_or_default(),
                parameters: def.input_schema.clone(),
                mutating,
                name: def.name,
            });
        }

        tracing::info!(
            count = specs.len(),
            mutating = specs.iter().filter(|s| s.mutating).count(),
            "Discovered tools"
        );
        Ok(specs)
    }

    async fn invoke(&self, name: &str, args: Value) -> Result<ToolResult, ToolInvocationError> {
        let result = self
            .client
            .call_tool(name, args)
            .await
            .map_err(|e| ToolInvocationError::new(name, failure_from_rpc(e)))?;

        if result.is_error {
            let message = result.text();
            let message = if message.trim().is_empty() {
                "tool reported an error".to_string()
            } else {
                message
            };
            return Err(ToolInvocationError::new(name, ToolFailure::Provider(message)));
        }

        Ok(ToolResult {
            output: result.text(),
            structured: result.structured_content,
        })
    }
}

fn failure_from_rpc(err: RpcError) -> ToolFailure {
    match err {
        RpcError::Timeout { secs, .. } => ToolFailure::Timeout(secs),
        RpcError::Transport(msg) => ToolFailure::Transport(msg),
        RpcError::Server(e) => ToolFailure::Provider(e.message),
    }
}
