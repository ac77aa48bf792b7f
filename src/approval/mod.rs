//! Confirmation gate for mutating tool calls.
//!
//! A mutating call (sending or replying to an email, or anything the config
//! marks `always_ask`) is never executed directly. The session raises a
//! [`PendingConfirmation`] and the user's next utterance resolves it. Only an
//! affirmative word resolves to [`Resolution::Confirmed`]; everything else,
//! including empty input, is a decline. Every decision lands in an audit log.

use crate::config::ConfirmationConfig;
use crate::tools::ToolCallRequest;
use crate::util::{indent_lines, truncate_with_ellipsis};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

// ── Types ────────────────────────────────────────────────────────

/// The user's answer to a confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalResponse {
    /// Execute the pending call.
    Yes,
    /// Drop the pending call.
    No,
}

/// A single audit log entry for a confirmation decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalLogEntry {
    pub timestamp: String,
    pub tool_name: String,
    pub call_id: String,
    pub arguments_summary: String,
    pub decision: ApprovalResponse,
}

/// Observable state of the gate. `Executing` and `Aborted` are transient:
/// they are the two [`Resolution`] outcomes, after which the gate is idle again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    AwaitingConfirmation,
}

/// A mutating call waiting for the user's yes/no.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingConfirmation {
    pub tool_call: ToolCallRequest,
    pub rendered_preview: String,
}

impl PendingConfirmation {
    /// The closing question shown under the preview.
    pub fn question(&self) -> String {
        confirmation_question(&self.tool_call.tool_name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Confirmed(ToolCallRequest),
    Declined(ToolCallRequest),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GateError {
    #[error("a confirmation for `{0}` is already pending")]
    AlreadyPending(String),
}

// ── MutationPolicy ───────────────────────────────────────────────

/// Decides which tools are mutating, once, at discovery time.
///
/// A tool is mutating when its lowercased name contains a keyword anywhere
/// (`send_email`, `sendmail`, `resend_email`, `replyAll`), when it is listed
/// in `always_ask`, or when the server flags it with `destructiveHint`. Tools
/// in `never_ask` are exempt from the keyword match only, so a read-only name
/// such as `list_senders` can be allowed through explicitly.
#[derive(Debug, Clone)]
pub struct MutationPolicy {
    keywords: Vec<String>,
    always_ask: HashSet<String>,
    never_ask: HashSet<String>,
}

impl MutationPolicy {
    pub fn new<K, A>(keywords: K, always_ask: A) -> Self
    where
        K: IntoIterator,
        K::Item: AsRef<str>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            always_ask: always_ask.into_iter().map(Into::into).collect(),
            never_ask: HashSet::new(),
        }
    }

    /// Tool names the keyword match should not flag.
    pub fn with_never_ask<N>(mut self, never_ask: N) -> Self
    where
        N: IntoIterator,
        N::Item: Into<String>,
    {
        self.never_ask = never_ask.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_config(config: &ConfirmationConfig) -> Self {
        Self::new(&config.mutating_keywords, config.always_ask.iter().cloned())
            .with_never_ask(config.never_ask.iter().cloned())
    }

    pub fn is_mutating(&self, tool_name: &str, destructive_hint: bool) -> bool {
        if destructive_hint || self.always_ask.contains(tool_name) {
            return true;
        }
        if self.never_ask.contains(tool_name) {
            return false;
        }
        let name = tool_name.to_lowercase();
        self.keywords.iter().any(|keyword| name.contains(keyword.as_str()))
    }
}

/// Tools whose confirmation reads as an email send rather than a generic action.
pub fn sends_email(tool_name: &str) -> bool {
    let name = tool_name.to_lowercase();
    name.contains("send") || name.contains("reply")
}

fn confirmation_question(tool_name: &str) -> String {
    if sends_email(tool_name) {
        "Send this email? (yes/no)".to_string()
    } else {
        format!("Proceed with `{tool_name}`? (yes/no)")
    }
}

// ── ConfirmationGate ─────────────────────────────────────────────

/// Holds at most one [`PendingConfirmation`] and the decision audit trail.
pub struct ConfirmationGate {
    affirmative: HashSet<String>,
    pending: Mutex<Option<PendingConfirmation>>,
    audit_log: Mutex<Vec<ApprovalLogEntry>>,
}

impl ConfirmationGate {
    pub fn new<I>(affirmative: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Self {
            affirmative: affirmative
                .into_iter()
                .map(|w| w.as_ref().trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
            pending: Mutex::new(None),
            audit_log: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &ConfirmationConfig) -> Self {
        Self::new(&config.affirmative)
    }

    pub fn state(&self) -> GateState {
        if self.pending.lock().is_some() {
            GateState::AwaitingConfirmation
        } else {
            GateState::Idle
        }
    }

    pub fn pending(&self) -> Option<PendingConfirmation> {
        self.pending.lock().clone()
    }

    /// Park a mutating call until the user answers.
    ///
    /// Fails without touching the outstanding confirmation if one exists.
    pub fn raise(&self, call: ToolCallRequest) -> Result<PendingConfirmation, GateError> {
        let mut slot = self.pending.lock();
        if let Some(existing) = slot.as_ref() {
            return Err(GateError::AlreadyPending(existing.tool_call.tool_name.clone()));
        }

        let pending = PendingConfirmation {
            rendered_preview: render_preview(&call.tool_name, &call.arguments),
            tool_call: call,
        };
        tracing::info!(
            tool = %pending.tool_call.tool_name,
            call_id = %pending.tool_call.call_id,
            "Awaiting user confirmation"
        );
        *slot = Some(pending.clone());
        Ok(pending)
    }

    /// Resolve the outstanding confirmation with the user's raw reply.
    ///
    /// Returns `None` when nothing is pending. The gate is idle afterwards.
    pub fn resolve(&self, user_text: &str) -> Option<Resolution> {
        let pending = self.pending.lock().take()?;
        let normalized = user_text.trim().to_lowercase();
        let decision = if self.affirmative.contains(&normalized) {
            ApprovalResponse::Yes
        } else {
            ApprovalResponse::No
        };

        self.record_decision(&pending.tool_call, decision);
        tracing::info!(
            tool = %pending.tool_call.tool_name,
            call_id = %pending.tool_call.call_id,
            decision = ?decision,
            "Confirmation resolved"
        );

        Some(match decision {
            ApprovalResponse::Yes => Resolution::Confirmed(pending.tool_call),
            ApprovalResponse::No => Resolution::Declined(pending.tool_call),
        })
    }

    fn record_decision(&self, call: &ToolCallRequest, decision: ApprovalResponse) {
        let entry = ApprovalLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            tool_name: call.tool_name.clone(),
            call_id: call.call_id.clone(),
            arguments_summary: summarize_args(&call.arguments),
            decision,
        };
        self.audit_log.lock().push(entry);
    }

    /// Get a snapshot of the audit log.
    pub fn audit_log(&self) -> Vec<ApprovalLogEntry> {
        self.audit_log.lock().clone()
    }
}

// ── Preview rendering ────────────────────────────────────────────

const RECIPIENT_KEYS: &[&str] = &["to", "recipient", "recipients"];
const CC_KEYS: &[&str] = &["cc"];
const BCC_KEYS: &[&str] = &["bcc"];
const SUBJECT_KEYS: &[&str] = &["subject"];
const THREAD_KEYS: &[&str] = &[
    "threadId",
    "thread_id",
    "inReplyTo",
    "in_reply_to",
    "messageId",
    "message_id",
];
const BODY_KEYS: &[&str] = &["body", "text", "message", "content"];

/// Human-readable preview of a pending call. Email fields are shown in full;
/// any other arguments are summarized on one line.
pub fn render_preview(tool_name: &str, args: &Value) -> String {
    let Value::Object(map) = args else {
        return format!("🔧 `{tool_name}` with {}", summarize_args(args));
    };

    let mut rest = map.clone();
    let mut lines = vec![if sends_email(tool_name) {
        format!("📧 Ready to run `{tool_name}`:")
    } else {
        format!("🔧 `{tool_name}` wants to run with:")
    }];

    for (label, keys) in [
        ("To", RECIPIENT_KEYS),
        ("Cc", CC_KEYS),
        ("Bcc", BCC_KEYS),
        ("Subject", SUBJECT_KEYS),
        ("Thread", THREAD_KEYS),
    ] {
        if let Some(value) = take_first(&mut rest, keys) {
            lines.push(format!("   {label}: {value}"));
        }
    }

    let body = take_first(&mut rest, BODY_KEYS);

    if !rest.is_empty() {
        lines.push(format!("   Other: {}", summarize_args(&Value::Object(rest))));
    }
    if let Some(body) = body {
        lines.push(String::new());
        lines.push(indent_lines(&body, "   "));
    }
    lines.join("\n")
}

fn take_first(map: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| map.remove(*key))
        .map(|value| display_value(&value))
        .filter(|s| !s.is_empty())
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(display_value)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Produce a short human-readable summary of tool arguments.
pub fn summarize_args(args: &Value) -> String {
    match args {
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| {
                    let val = match v {
                        Value::String(s) => truncate_with_ellipsis(s, 80),
                        other => truncate_with_ellipsis(&other.to_string(), 80),
                    };
                    format!("{k}: {val}")
                })
                .collect();
            parts.join(", ")
        }
        other => truncate_with_ellipsis(&other.to_string(), 120),
    }
}

// ── Tests ────────────────────────────────────────────────────────
