//! Language model backends.
//!
//! The session talks to a [`Provider`]; [`create_provider`] builds the
//! OpenAI-compatible adapter from `[provider]` config. Error text coming back
//! from the API passes through [`sanitize_api_error`] before it reaches logs or
//! the transcript, since bodies sometimes echo keys and OAuth tokens.

pub mod openai;
pub mod traits;

pub use traits::{ChatMessage, ChatRequest, ChatResponse, Provider, ToolCall, ToolResultMessage};

use crate::config::ProviderConfig;

const MAX_API_ERROR_CHARS: usize = 200;

/// Build the configured provider.
pub fn create_provider(config: &ProviderConfig) -> anyhow::Result<Box<dyn Provider>> {
    let provider = openai::OpenAiProvider::from_config(config)?;
    tracing::debug!(api_url = %config.api_url, model = %config.model, "Provider ready");
    Ok(Box::new(provider))
}

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/')
}

fn token_end(input: &str, from: usize) -> usize {
    let mut end = from;
    for (i, c) in input[from..].char_indices() {
        if is_secret_char(c) {
            end = from + i + c.len_utf8();
        } else {
            break;
        }
    }
    end
}

/// Scrub known secret-like token prefixes from provider error strings.
///
/// Covers OpenAI keys (`sk-`), Google API keys (`AIza`), Google OAuth client
/// secrets (`GOCSPX-`) and access tokens (`ya29.`), plus `key=value` and
/// JSON-field forms of common token names and `Bearer` headers.
pub fn scrub_secret_patterns(input: &str) -> String {
    const PREFIXES: [(&str, usize); 19] = [
        ("sk-", 1),
        ("AIza", 1),
        ("GOCSPX-", 1),
        ("ya29.", 1),
        ("1//", 8),
        ("\"access_token\":\"", 8),
        ("\"refresh_token\":\"", 8),
        ("\"id_token\":\"", 8),
        ("\"token\":\"", 8),
        ("\"api_key\":\"", 8),
        ("\"client_secret\":\"", 8),
        ("access_token=", 8),
        ("refresh_token=", 8),
        ("id_token=", 8),
        ("token=", 8),
        ("api_key=", 8),
        ("client_secret=", 8),
        ("Bearer ", 16),
        ("bearer ", 16),
    ];

    let mut scrubbed = input.to_string();

    for (prefix, min_len) in PREFIXES {
        let mut search_from = 0;
        loop {
            let Some(rel) = scrubbed[search_from..].find(prefix) else {
                break;
            };

            let start = search_from + rel;
            let content_start = start + prefix.len();
            let end = token_end(&scrubbed, content_start);
            let token_len = end.saturating_sub(content_start);

            // Bare prefixes like "sk-" should not stop future scans.
            if token_len < min_len {
                search_from = content_start;
                continue;
            }

            scrubbed.replace_range(start..end, "[REDACTED]");
            search_from = start + "[REDACTED]".len();
        }
    }

    scrubbed
}

/// Sanitize API error text by scrubbing secrets and truncating length.
pub fn sanitize_api_error(input: &str) -> String {
    let scrubbed = scrub_secret_patterns(input);

    if scrubbed.chars().count() <= MAX_API_ERROR_CHARS {
        return scrubbed;
    }

    let mut end = MAX_API_ERROR_CHARS;
    while end > 0 && !scrubbed.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}...", &scrubbed[..end])
}

/// Build a sanitized provider error from a failed HTTP response.
pub async fn api_error(provider: &str, response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read provider error body>".to_string());
    let sanitized = sanitize_api_error(&body);
    anyhow::anyhow!("{provider} API error ({status}): {sanitized}")
}
