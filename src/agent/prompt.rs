use crate::tools::ToolSpec;
use chrono::Local;
use std::fmt::Write;

/// Default assistant instructions. Confirmation is enforced by the gate either
/// way; the prompt only keeps the model's wording consistent with it.
pub const DEFAULT_INSTRUCTIONS: &str = "\
You are a helpful Gmail assistant.
When the user asks to send or reply to an email you MUST:
1. Draft the email with the appropriate tool.
2. Show the full draft (to, cc, subject, body) to the user.
3. Ask explicitly: \"Send this email? (yes/no)\".
4. Only call the send tool if the user answers yes / y / send.
If the user declines, abort sending and report that the email was not sent.
When summarising, be concise.";

pub struct PromptContext<'a> {
    pub tools: &'a [ToolSpec],
    /// Replaces [`DEFAULT_INSTRUCTIONS`] when set.
    pub instructions: Option<&'a str>,
}

pub trait PromptSection: Send + Sync {
    fn name(&self) -> &str;
    fn build(&self, ctx: &PromptContext<'_>) -> String;
}

#[derive(Default)]
pub struct SystemPromptBuilder {
    sections: Vec<Box<dyn PromptSection>>,
}

impl SystemPromptBuilder {
    pub fn with_defaults() -> Self {
        Self {
            sections: vec![
                Box::new(InstructionsSection),
                Box::new(ToolsSection),
                Box::new(DateTimeSection),
            ],
        }
    }

    pub fn add_section(mut self, section: Box<dyn PromptSection>) -> Self {
        self.sections.push(section);
        self
    }

    pub fn build(&self, ctx: &PromptContext<'_>) -> String {
        let mut output = String::new();
        for section in &self.sections {
            let part = section.build(ctx);
            if part.trim().is_empty() {
                continue;
            }
            output.push_str(part.trim_end());
            output.push_str("\n\n");
        }
        output.trim_end().to_string()
    }
}

pub struct InstructionsSection;
pub struct ToolsSection;
pub struct DateTimeSection;

impl PromptSection for InstructionsSection {
    fn name(&self) -> &str {
        "instructions"
    }

    fn build(&self, ctx: &PromptContext<'_>) -> String {
        ctx.instructions
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_INSTRUCTIONS)
            .to_string()
    }
}

impl PromptSection for ToolsSection {
    fn name(&self) -> &str {
        "tools"
    }

    fn build(&self, ctx: &PromptContext<'_>) -> String {
        if ctx.tools.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Available Tools\n\n");
        for tool in ctx.tools {
            let description = tool.description.lines().next().unwrap_or("").trim();
            let _ = write!(out, "- **{}**", tool.name);
            if !description.is_empty() {
                let _ = write!(out, ": {description}");
            }
            if tool.mutating {
                out.push_str(" (runs only after the user confirms)");
            }
            out.push('\n');
        }
        out
    }
}

impl PromptSection for DateTimeSection {
    fn name(&self) -> &str {
        "datetime"
    }

    fn build(&self, _ctx: &PromptContext<'_>) -> String {
        let now = Local::now();
        format!(
            "## Current Date & Time\n\n{} ({})",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.format("%Z")
        )
    }
}

/// System prompt for a session with the given tools.
pub fn build_system_prompt(instructions: Option<&str>, tools: &[ToolSpec]) -> String {
    SystemPromptBuilder::with_defaults().build(&PromptContext {
        tools,
        instructions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tools() -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "search_emails".into(),
                description: "Search emails with Gmail query syntax\nMore detail".into(),
                parameters: json!({"type": "object"}),
                mutating: false,
            },
            ToolSpec {
                name: "send_email".into(),
                description: "Send a new email".into(),
                parameters: json!({"type": "object"}),
                mutating: true,
            },
        ]
    }

    #[test]
    fn default_prompt_includes_instructions_and_tools() {
        let prompt = build_system_prompt(None, &tools());
        assert!(prompt.starts_with("You are a helpful Gmail assistant."));
        assert!(prompt.contains("Send this email? (yes/no)"));
        assert!(prompt.contains("- **search_emails**: Search emails with Gmail query syntax\n"));
        assert!(prompt.contains("- **send_email**: Send a new email (runs only after the user confirms)"));
        assert!(!prompt.contains("More detail"));
        assert!(prompt.contains("## Current Date & Time"));
    }

    #[test]
    fn override_replaces_instructions_only() {
        let prompt = build_system_prompt(Some("Reply in French."), &tools());
        assert!(prompt.starts_with("Reply in French."));
        assert!(!prompt.contains("helpful Gmail assistant"));
        assert!(prompt.contains("## Available Tools"));
    }

    #[test]
    fn blank_override_falls_back_to_default() {
        let prompt = build_system_prompt(Some("   "), &[]);
        assert!(prompt.starts_with("You are a helpful Gmail assistant."));
        assert!(!prompt.contains("## Available Tools"));
    }

    struct SignatureSection;

    impl PromptSection for SignatureSection {
        fn name(&self) -> &str {
            "signature"
        }

        fn build(&self, _ctx: &PromptContext<'_>) -> String {
            "Sign emails as Sam.".into()
        }
    }

    #[test]
    fn custom_sections_are_appended() {
        let prompt = SystemPromptBuilder::default()
            .add_section(Box::new(SignatureSection))
            .build(&PromptContext {
                tools: &[],
                instructions: None,
            });
        assert_eq!(prompt, "Sign emails as Sam.");
    }
}
