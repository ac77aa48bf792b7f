//! One conversation: transcript, tool gateway, confirmation gate and the
//! request/response cycle that ties them to the language model.

use crate::agent::dispatcher::NativeToolDispatcher;
use crate::agent::prompt::build_system_prompt;
use crate::agent::transcript::{InMemoryTranscript, TranscriptStore, Turn};
use crate::approval::{sends_email, ConfirmationGate, PendingConfirmation, Resolution};
use crate::config::{AgentConfig, Config};
use crate::error::{ModelError, ToolFailure, ToolInvocationError};
use crate::providers::{ChatRequest, ChatResponse, Provider};
use crate::tools::{ToolCallRequest, ToolGateway, ToolSpec};
use crate::util::indent_lines;
use anyhow::Result;
use std::sync::Arc;

/// Completion attempts per model call (the first try plus one retry).
const MODEL_ATTEMPTS: usize = 2;

pub(crate) const MODEL_FAILURE_REPLY: &str =
    "Sorry, I couldn't reach the language model just now. Please try again in a moment.";

pub(crate) const EMPTY_REPLY: &str = "I wasn't able to come up with a response. Could you rephrase that?";

pub struct Session {
    provider: Box<dyn Provider>,
    gateway: Arc<dyn ToolGateway>,
    tool_specs: Vec<ToolSpec>,
    transcript: Box<dyn TranscriptStore>,
    gate: ConfirmationGate,
    model_name: String,
    temperature: f64,
    max_tool_iterations: usize,
}

pub struct SessionBuilder {
    provider: Option<Box<dyn Provider>>,
    gateway: Option<Arc<dyn ToolGateway>>,
    tool_specs: Option<Vec<ToolSpec>>,
    transcript: Option<Box<dyn TranscriptStore>>,
    gate: Option<ConfirmationGate>,
    config: Option<AgentConfig>,
    model_name: Option<String>,
    temperature: Option<f64>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            gateway: None,
            tool_specs: None,
            transcript: None,
            gate: None,
            config: None,
            model_name: None,
            temperature: None,
        }
    }

    /// Provider, model, gate and loop settings from a loaded [`Config`].
    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .config(config.agent.clone())
            .model_name(config.provider.model.clone())
            .temperature(config.provider.temperature)
            .gate(ConfirmationGate::from_config(&config.confirmation))
    }

    pub fn provider(mut self, provider: Box<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn ToolGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Skip discovery and use these tools. Mostly for tests.
    pub fn tool_specs(mut self, tool_specs: Vec<ToolSpec>) -> Self {
        self.tool_specs = Some(tool_specs);
        self
    }

    /// Use a different transcript store. A system turn is added if it is empty.
    pub fn transcript(mut self, transcript: Box<dyn TranscriptStore>) -> Self {
        self.transcript = Some(transcript);
        self
    }

    pub fn gate(mut self, gate: ConfirmationGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn model_name(mut self, model_name: String) -> Self {
        self.model_name = Some(model_name);
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Discover tools (unless given) and assemble the session.
    ///
    /// Discovery failures surface as [`crate::error::ToolDiscoveryError`]
    /// inside the returned error.
    pub async fn build(self) -> Result<Session> {
        let provider = self
            .provider
            .ok_or_else(|| anyhow::anyhow!("provider is required"))?;
        let gateway = self
            .gateway
            .ok_or_else(|| anyhow::anyhow!("gateway is required"))?;
        let tool_specs = match self.tool_specs {
            Some(specs) => specs,
            None => gateway.list_tools().await?,
        };
        let config = self.config.unwrap_or_default();

        let system_prompt = build_system_prompt(config.system_prompt.as_deref(), &tool_specs);
        let transcript = match self.transcript {
            Some(mut store) => {
                if store.is_empty() {
                    store.append(Turn::system(system_prompt));
                }
                store
            }
            None => Box::new(InMemoryTranscript::new(system_prompt)),
        };

        Ok(Session {
            provider,
            gateway,
            tool_specs,
            transcript,
            gate: self
                .gate
                .unwrap_or_else(|| ConfirmationGate::new(["yes", "y", "send", "confirm"])),
            model_name: self.model_name.unwrap_or_else(|| "gpt-4o-mini".into()),
            temperature: self.temperature.unwrap_or(0.0),
            max_tool_iterations: config.effective_max_tool_iterations(),
        })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn tools(&self) -> &[ToolSpec] {
        &self.tool_specs
    }

    pub fn transcript(&self) -> Vec<Turn> {
        self.transcript.snapshot()
    }

    pub fn pending_confirmation(&self) -> Option<PendingConfirmation> {
        self.gate.pending()
    }

    pub fn gate(&self) -> &ConfirmationGate {
        &self.gate
    }

    /// Handle one user utterance and return the reply to show.
    ///
    /// While a confirmation is pending the utterance is only a yes/no answer:
    /// it is not recorded as a user turn and never reaches the model.
    pub async fn handle_turn(&mut self, user_text: &str) -> String {
        if let Some(resolution) = self.gate.resolve(user_text) {
            return self.finish_confirmation(resolution).await;
        }

        self.transcript.append(Turn::user(user_text));
        let mut failures: Vec<String> = Vec::new();

        for iteration in 0..self.max_tool_iterations {
            let response = match self.complete().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(iteration, error = %e, "Model call failed after retry");
                    return self.reply(MODEL_FAILURE_REPLY.to_string());
                }
            };

            let calls = NativeToolDispatcher::parse_response(&response);
            if calls.is_empty() {
                let text = response.text_or_empty().trim();
                let mut reply = if text.is_empty() {
                    EMPTY_REPLY.to_string()
                } else {
                    text.to_string()
                };
                append_failure_notes(&mut reply, &failures);
                return self.reply(reply);
            }

            tracing::info!(iteration, count = calls.len(), "Model requested tools");
            self.transcript.append(Turn::assistant_tool_calls(
                response.text.clone(),
                calls.clone(),
            ));

            if let Some(pending) = self.run_tool_calls(&calls, &mut failures).await {
                return confirmation_prompt(response.text.as_deref(), &pending, &failures);
            }
        }

        tracing::warn!(
            max_iterations = self.max_tool_iterations,
            "Tool loop exceeded iteration limit"
        );
        let mut reply = format!(
            "I couldn't finish that request within {} steps. Try breaking it into smaller requests.",
            self.max_tool_iterations
        );
        append_failure_notes(&mut reply, &failures);
        self.reply(reply)
    }

    /// Walk one completion's tool calls in order. Stops at the first mutating
    /// call, raising a confirmation for it and skipping the rest.
    async fn run_tool_calls(
        &mut self,
        calls: &[ToolCallRequest],
        failures: &mut Vec<String>,
    ) -> Option<PendingConfirmation> {
        for (index, call) in calls.iter().enumerate() {
            let Some(spec) = self.tool_specs.iter().find(|s| s.name == call.tool_name) else {
                tracing::warn!(tool = %call.tool_name, call_id = %call.call_id, "Model requested unknown tool");
                self.transcript.append(Turn::tool_failure(
                    &call.call_id,
                    format!("unknown tool `{}`", call.tool_name),
                ));
                continue;
            };

            if spec.mutating {
                return match self.gate.raise(call.clone()) {
                    Ok(pending) => {
                        self.skip_remaining(&calls[index + 1..], &call.tool_name);
                        Some(pending)
                    }
                    Err(e) => {
                        tracing::warn!(tool = %call.tool_name, error = %e, "Could not raise confirmation");
                        self.transcript
                            .append(Turn::tool_failure(&call.call_id, e.to_string()));
                        self.skip_remaining(&calls[index + 1..], &call.tool_name);
                        None
                    }
                };
            }

            self.execute(call, failures).await;
        }
        None
    }

    async fn execute(&mut self, call: &ToolCallRequest, failures: &mut Vec<String>) {
        tracing::info!(tool = %call.tool_name, call_id = %call.call_id, "Invoking tool");
        match self
            .gateway
            .invoke(&call.tool_name, call.arguments.clone())
            .await
        {
            Ok(result) => self.transcript.append(Turn::tool_output(
                &call.call_id,
                true,
                result.output,
                result.structured,
            )),
            Err(e) => {
                tracing::warn!(tool = %call.tool_name, call_id = %call.call_id, error = %e, "Tool call failed");
                self.transcript
                    .append(Turn::tool_failure(&call.call_id, e.cause.to_string()));
                failures.push(e.to_string());
            }
        }
    }

    fn skip_remaining(&mut self, rest: &[ToolCallRequest], awaiting: &str) {
        for skipped in rest {
            tracing::debug!(tool = %skipped.tool_name, call_id = %skipped.call_id, "Skipping tool call");
            self.transcript.append(Turn::tool_failure(
                &skipped.call_id,
                format!("skipped: awaiting user confirmation of `{awaiting}`"),
            ));
        }
    }

    async fn finish_confirmation(&mut self, resolution: Resolution) -> String {
        match resolution {
            Resolution::Confirmed(call) => {
                tracing::info!(tool = %call.tool_name, call_id = %call.call_id, "Executing confirmed call");
                match self
                    .gateway
                    .invoke(&call.tool_name, call.arguments.clone())
                    .await
                {
                    Ok(result) => {
                        let output = result.output.trim().to_string();
                        self.transcript.append(Turn::tool_output(
                            &call.call_id,
                            true,
                            result.output,
                            result.structured,
                        ));
                        let mut reply = if sends_email(&call.tool_name) {
                            "✅ Email sent.".to_string()
                        } else {
                            format!("✅ `{}` completed.", call.tool_name)
                        };
                        if !output.is_empty() {
                            reply.push_str("\n\n");
                            reply.push_str(&indent_lines(&output, "   "));
                        }
                        self.reply(reply)
                    }
                    Err(e) => {
                        tracing::warn!(tool = %call.tool_name, error = %e, "Confirmed call failed");
                        self.transcript
                            .append(Turn::tool_failure(&call.call_id, e.cause.to_string()));
                        self.reply(confirmed_failure_reply(&call.tool_name, &e))
                    }
                }
            }
            Resolution::Declined(call) => {
                self.transcript.append(Turn::tool_failure(
                    &call.call_id,
                    "declined by the user; the action was not performed",
                ));
                let reply = if sends_email(&call.tool_name) {
                    "❌ Cancelled. The email was not sent.".to_string()
                } else {
                    format!("❌ Cancelled. `{}` was not run.", call.tool_name)
                };
                self.reply(reply)
            }
        }
    }

    /// Ask the model for the next step, retrying once on failure.
    async fn complete(&self) -> std::result::Result<ChatResponse, ModelError> {
        let messages = NativeToolDispatcher::to_provider_messages(&self.transcript.snapshot());
        let mut last_error = ModelError::Request("no attempt made".into());

        for attempt in 1..=MODEL_ATTEMPTS {
            let request = ChatRequest {
                messages: &messages,
                tools: Some(self.tool_specs.as_slice()),
            };
            match self
                .provider
                .chat(request, &self.model_name, self.temperature)
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let err = classify_model_error(e);
                    tracing::warn!(
                        provider = self.provider.name(),
                        attempt,
                        error = %err,
                        "Model call failed"
                    );
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    /// Record the assistant reply and hand it back.
    fn reply(&mut self, text: String) -> String {
        self.transcript.append(Turn::assistant(text.clone()));
        text
    }
}

fn classify_model_error(err: anyhow::Error) -> ModelError {
    match err.downcast::<ModelError>() {
        Ok(model_error) => model_error,
        Err(other) => ModelError::Request(format!("{other:#}")),
    }
}

/// Only a server-reported error means the action did not happen; after a
/// timeout or transport failure the outcome is unknown.
fn confirmed_failure_reply(tool_name: &str, err: &ToolInvocationError) -> String {
    let email = sends_email(tool_name);
    match (&err.cause, email) {
        (ToolFailure::Provider(_), true) => format!("⚠️ The email was not sent: {err}"),
        (ToolFailure::Provider(_), false) => format!("⚠️ {err}"),
        (ToolFailure::Timeout(_) | ToolFailure::Transport(_), true) => format!(
            "⚠️ The email may or may not have been sent: {err}\n\
             Check your Sent folder before trying again."
        ),
        (ToolFailure::Timeout(_) | ToolFailure::Transport(_), false) => format!(
            "⚠️ `{tool_name}` may or may not have completed: {err}\n\
             Check the mailbox before trying again."
        ),
    }
}

fn append_failure_notes(reply: &mut String, failures: &[String]) {
    if failures.is_empty() {
        return;
    }
    reply.push_str("\n\n⚠️ Some tool calls failed:");
    for failure in failures {
        reply.push_str("\n- ");
        reply.push_str(failure);
    }
}

fn confirmation_prompt(
    model_text: Option<&str>,
    pending: &PendingConfirmation,
    failures: &[String],
) -> String {
    let mut out = String::new();
    if let Some(text) = model_text.map(str::trim).filter(|t| !t.is_empty()) {
        out.push_str(text);
        out.push_str("\n\n");
    }
    out.push_str(&pending.rendered_preview);
    append_failure_notes(&mut out, failures);
    out.push_str("\n\n");
    out.push_str(&pending.question());
    out
}
