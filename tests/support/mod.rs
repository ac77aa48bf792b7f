//! Shared doubles for integration tests: a scripted model and an in-process
//! MCP mailbox server speaking newline-delimited JSON-RPC over a duplex pipe.
#![allow(dead_code)]

use async_trait::async_trait;
use inboxclaw::approval::MutationPolicy;
use inboxclaw::config::ConfirmationConfig;
use inboxclaw::providers::{ChatRequest, ChatResponse, Provider, ToolCall};
use inboxclaw::tools::{McpClient, McpGateway};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

// ── Model ────────────────────────────────────────────────────────

/// Plays back completions in order; answers "done" once exhausted.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<ChatResponse>>,
    pub calls: Arc<Mutex<usize>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Arc::new(Mutex::new(0)),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(
        &self,
        _request: ChatRequest<'_>,
        _model: &str,
        _temperature: f64,
    ) -> anyhow::Result<ChatResponse> {
        *self.calls.lock() += 1;
        Ok(self
            .responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| ChatResponse::text("done")))
    }
}

pub fn text(reply: &str) -> ChatResponse {
    ChatResponse::text(reply)
}

pub fn tool_calls(calls: &[(&str, &str, Value)]) -> ChatResponse {
    ChatResponse {
        text: None,
        tool_calls: calls
            .iter()
            .map(|(id, name, args)| ToolCall {
                id: (*id).to_string(),
                name: (*name).to_string(),
                arguments: args.to_string(),
            })
            .collect(),
        usage: None,
    }
}

// ── Tool server ──────────────────────────────────────────────────

/// Every `tools/call` the fake server received, in order.
pub type CallLog = Arc<Mutex<Vec<(String, Value)>>>;

pub fn mailbox_tools() -> Value {
    json!([
        {
            "name": "search_emails",
            "description": "Search messages with Gmail query syntax",
            "inputSchema": {"type": "object", "properties": {"query": {"type": "string"}}}
        },
        {
            "name": "draft_email",
            "description": "Create a draft",
            "inputSchema": {"type": "object"}
        },
        {
            "name": "send_email",
            "description": "Send an email",
            "inputSchema": {"type": "object"}
        }
    ])
}

/// Start a fake MCP server advertising `tools` and connect a gateway to it
/// with the default confirmation policy.
pub async fn mailbox_gateway(tools: Value) -> (McpGateway, CallLog) {
    let (client_end, server_end) = tokio::io::duplex(256 * 1024);
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(serve_mailbox(server_end, tools, log.clone()));

    let (read_half, write_half) = tokio::io::split(client_end);
    let client = McpClient::from_streams(
        "fake-mailbox",
        BufReader::new(read_half),
        write_half,
        Duration::from_secs(5),
    );
    client
        .initialize(Duration::from_secs(5))
        .await
        .expect("fake server handshake");

    let policy = MutationPolicy::from_config(&ConfirmationConfig::default());
    (McpGateway::from_client(client, policy), log)
}

async fn serve_mailbox(stream: tokio::io::DuplexStream, tools: Value, log: CallLog) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let request: Value = serde_json::from_str(&line).expect("client sends JSON");
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let result = match request["method"].as_str().unwrap_or_default() {
            "initialize" => json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake-mailbox", "version": "0.0.0"}
            }),
            "tools/list" => json!({ "tools": tools }),
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default().to_string();
                let args = params.get("arguments").cloned().unwrap_or(Value::Null);
                log.lock().push((name.clone(), args));
                json!({ "content": [{"type": "text", "text": canned_output(&name)}] })
            }
            _ => json!({}),
        };

        let mut out = json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string();
        out.push('\n');
        if write_half.write_all(out.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn canned_output(tool: &str) -> String {
    match tool {
        "search_emails" => [
            "1. From: alice@example.com | Subject: Team offsite | Unread",
            "2. From: billing@example.com | Subject: Invoice #4411 | Unread",
            "3. From: bob@example.com | Subject: Lunch Friday? | Unread",
        ]
        .join("\n"),
        "draft_email" => "Draft r-1029 created".to_string(),
        "send_email" => "Email sent successfully with ID: 18c2f0a".to_string(),
        other => format!("{other} ok"),
    }
}
