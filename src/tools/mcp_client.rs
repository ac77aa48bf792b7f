//! Stdio JSON-RPC client for MCP tool servers.
//!
//! The server is a child process speaking newline-delimited JSON-RPC 2.0 on
//! stdin/stdout. Its stderr is forwarded to `tracing` so launch failures are
//! visible instead of silently swallowed.

use super::mcp_protocol::{
    CallToolResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    McpToolDefinition, MCP_PROTOCOL_VERSION,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Maximum size (in bytes) for a single JSON-RPC response line.
const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

/// Upper bound on `tools/list` pages, in case a server keeps handing out cursors.
const MAX_LIST_PAGES: usize = 32;

/// Host environment variables passed through to the tool server.
/// Everything else is stripped; credentials must be forwarded explicitly.
const SAFE_ENV_KEYS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TERM",
    "SHELL",
    "TMPDIR",
    "TMP",
    "TEMP",
    "SYSTEMROOT",
    "APPDATA",
    "USERPROFILE",
    "XDG_RUNTIME_DIR",
    "XDG_DATA_HOME",
    "XDG_CONFIG_HOME",
    "XDG_CACHE_HOME",
    // npx needs these to find global packages
    "NODE_PATH",
    "NPM_CONFIG_PREFIX",
    "NVM_DIR",
];

/// How to launch a stdio tool server.
#[derive(Debug, Clone)]
pub struct StdioServerSpec {
    /// Label used in logs.
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Extra variables on top of the safe allowlist.
    pub env: BTreeMap<String, String>,
    pub init_timeout: Duration,
    pub rpc_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("MCP call `{method}` timed out after {secs}s")]
    Timeout { method: String, secs: u64 },
    #[error("MCP transport error: {0}")]
    Transport(String),
    #[error("MCP server error {}: {}", .0.code, .0.message)]
    Server(JsonRpcError),
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

type Reader = Box<dyn AsyncBufRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// JSON-RPC client over stdio for the MCP protocol.
pub struct McpClient {
    name: String,
    writer: Mutex<Writer>,
    reader: Mutex<Reader>,
    _child: Option<Child>,
    next_id: AtomicU64,
    rpc_timeout: Duration,
}

impl McpClient {
    /// Spawn the server subprocess and run the MCP handshake.
    pub async fn spawn(spec: &StdioServerSpec) -> Result<Self, RpcError> {
        let safe_env: Vec<(String, String)> = std::env::vars()
            .filter(|(k, _)| SAFE_ENV_KEYS.iter().any(|safe| safe == k))
            .collect();

        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .env_clear()
            .envs(safe_env)
            .envs(&spec.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RpcError::Transport(format!("failed to launch `{}`: {e}", spec.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RpcError::Transport("failed to capture tool server stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RpcError::Transport("failed to capture tool server stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let server = spec.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() {
                        tracing::warn!(mcp_server = %server, "{trimmed}");
                    }
                }
            });
        }

        tracing::debug!(
            mcp_server = %spec.name,
            command = %spec.command,
            "Spawned tool server"
        );

        let mut client = Self::from_streams(
            &spec.name,
            BufReader::new(stdout),
            stdin,
            spec.rpc_timeout,
        );
        client._child = Some(child);
        client.initialize(spec.init_timeout).await?;
        Ok(client)
    }

    /// Build a client over arbitrary streams. The caller runs [`Self::initialize`].
    pub fn from_streams(
        name: &str,
        reader: impl AsyncBufRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            writer: Mutex::new(Box::new(writer)),
            reader: Mutex::new(Box::new(reader)),
            _child: None,
            next_id: AtomicU64::new(1),
            rpc_timeout,
        }
    }

    /// `initialize` request followed by the `notifications/initialized` notification.
    pub async fn initialize(&self, timeout: Duration) -> Result<Value, RpcError> {
        let result = self
            .request_with_timeout(
                "initialize",
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
                timeout,
            )
            .await?;
        self.notify("notifications/initialized", json!({})).await?;
        Ok(result)
    }

    /// All tools, following `nextCursor` pagination.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, RpcError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let raw = self.request("tools/list", params).await?;
            let page: ListToolsResult = serde_json::from_value(raw)
                .map_err(|e| RpcError::Transport(format!("malformed tools/list result: {e}")))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(
            mcp_server = %self.name,
            pages = MAX_LIST_PAGES,
            "tools/list pagination did not terminate; using tools collected so far"
        );
        Ok(tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, RpcError> {
        let raw = self
            .request(
                "tools/call",
                json!({
                    "name": name,
                    "arguments": arguments,
                }),
            )
            .await?;
        serde_json::from_value(raw)
            .map_err(|e| RpcError::Transport(format!("malformed tools/call result: {e}")))
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.request_with_timeout(method, params, self.rpc_timeout)
            .await
    }

    async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        tokio::time::timeout(timeout, self.request_inner(method, params))
            .await
            .map_err(|_| RpcError::Timeout {
                method: method.to_string(),
                secs: timeout.as_secs(),
            })?
    }

    async fn request_inner(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.write_message(&JsonRpcRequest::new(id, method, params))
            .await?;

        let mut reader = self.reader.lock().await;
        loop {
            let Some(bytes) = read_bounded_line(&mut **reader, MAX_RESPONSE_BYTES).await? else {
                return Err(RpcError::Transport("tool server closed stdout".into()));
            };
            let line = String::from_utf8_lossy(&bytes);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let message: JsonRpcResponse = match serde_json::from_str(trimmed) {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!(mcp_server = %self.name, error = %e, "Skipping non JSON-RPC line");
                    continue;
                }
            };

            if !message.answers(id) {
                // Server notifications or a late answer to a timed-out request.
                tracing::trace!(mcp_server = %self.name, method = ?message.method, "Skipping unrelated message");
                continue;
            }
            if let Some(error) = message.error {
                return Err(RpcError::Server(error));
            }
            return Ok(message.result.unwrap_or(Value::Null));
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        self.write_message(&JsonRpcRequest::notification(method, params))
            .await
    }

    async fn write_message(&self, message: &JsonRpcRequest) -> Result<(), RpcError> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| RpcError::Transport(format!("failed to encode request: {e}")))?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Reads one line, buffering at most `limit + 1` bytes of it.
/// `Ok(None)` means the stream is at EOF.
async fn read_bounded_line<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>, RpcError>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let mut line = Vec::new();
    let bytes_read = (&mut *reader).take(cap).read_until(b'\n', &mut line).await?;
    if bytes_read == 0 {
        return Ok(None);
    }
    if line.len() > limit {
        return Err(RpcError::Transport(format!(
            "response exceeded size limit (more than {limit} bytes)"
        )));
    }
    Ok(Some(line))
}

#[cfg(test)]
pub(crate) mod test_support {
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Serve scripted JSON-RPC answers on one end of a duplex pipe.
    /// `respond` maps (method, params) to `Ok(result)` or `Err(error object)`.
    pub(crate) async fn serve<F>(stream: DuplexStream, mut respond: F)
    where
        F: FnMut(&str, &Value) -> Result<Value, Value> + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let request: Value = serde_json::from_str(&line).unwrap();
            let Some(id) = request.get("id").cloned() else {
                continue;
            };
            let method = request["method"].as_str().unwrap_or_default().to_string();
            let params = request.get("params").cloned().unwrap_or(Value::Null);
            let reply = match respond(&method, &params) {
                Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
            };
            let mut out = serde_json::to_string(&reply).unwrap();
            out.push('\n');
            if write_half.write_all(out.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}
