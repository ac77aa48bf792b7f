#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use inboxclaw::agent::{shell, SessionBuilder};
use inboxclaw::approval::MutationPolicy;
use inboxclaw::auth::AuthService;
use inboxclaw::config::Config;
use inboxclaw::error::{ConfigurationError, ToolDiscoveryError};
use inboxclaw::providers::create_provider;
use inboxclaw::tools::{server_spec, McpGateway, ToolGateway};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// Chat with your mailbox. Nothing is sent until you say yes.
#[derive(Parser, Debug)]
#[command(name = "inboxclaw")]
#[command(version)]
#[command(about = "Conversational email assistant with confirmation-gated sending.", long_about = None)]
struct Cli {
    /// Directory holding config.toml (default: ~/.inboxclaw)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Log progress to stderr (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the interactive chat (default)
    Chat {
        /// Handle a single message and exit
        #[arg(short, long)]
        message: Option<String>,

        /// Model to use instead of provider.model
        #[arg(long)]
        model: Option<String>,
    },

    /// Start the tool server and list the tools it exposes
    Tools,

    /// Prepare tool-server credentials (Gmail OAuth) without chatting
    Auth,

    /// Generate shell completion scripts for `inboxclaw`.
    #[command(long_about = "\
Generate shell completion scripts for `inboxclaw`.

The script is printed to stdout so it can be sourced directly:

Examples:
  source <(inboxclaw completions bash)
  inboxclaw completions zsh > ~/.zfunc/_inboxclaw")]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Completions stay stdout-only: no config, no logging.
    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = write_shell_completion(*shell, &mut stdout) {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
        return;
    }

    let _ = dotenvy::dotenv();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        report_startup_error(&e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Warning: failed to initialize logging: {e}");
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Some(dir) = &cli.config_dir {
        if dir.as_os_str().is_empty() {
            bail!("--config-dir cannot be empty");
        }
    }

    let mut config = Config::load_or_init(cli.config_dir.as_deref()).await?;

    match cli.command.unwrap_or(Commands::Chat {
        message: None,
        model: None,
    }) {
        Commands::Chat { message, model } => {
            apply_model_override(&mut config, model)?;
            chat(&config, message).await
        }
        Commands::Tools => list_tools(&config).await,
        Commands::Auth => {
            let report = AuthService::from_config(&config)
                .prepare_tool_server(host_env)
                .await?;
            if let Some(path) = report.keys_written {
                println!("Wrote OAuth client file to {}", path.display());
            }
            if report.authorized {
                println!("Gmail authorization complete.");
            }
            println!("Tool server credentials are ready.");
            Ok(())
        }
        Commands::Completions { .. } => Ok(()),
    }
}

/// `--model` replaces `provider.model`, so the result is validated again.
fn apply_model_override(config: &mut Config, model: Option<String>) -> Result<()> {
    if let Some(model) = model {
        config.provider.model = model;
        config.validate()?;
    }
    Ok(())
}

fn host_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

async fn connect_gateway(config: &Config) -> Result<McpGateway> {
    AuthService::from_config(config)
        .prepare_tool_server(host_env)
        .await?;

    let spec = server_spec(&config.tool_server, host_env);
    let gateway = McpGateway::connect(&spec, MutationPolicy::from_config(&config.confirmation))
        .await?;
    Ok(gateway)
}

async fn chat(config: &Config, message: Option<String>) -> Result<()> {
    AuthService::from_config(config).check_provider()?;

    let provider = create_provider(&config.provider)?;
    let gateway = connect_gateway(config).await?;

    let mut session = SessionBuilder::from_config(config)
        .provider(provider)
        .gateway(Arc::new(gateway))
        .build()
        .await?;

    tracing::info!(
        tools = session.tools().len(),
        model = %config.provider.model,
        "Session ready"
    );

    match message {
        Some(message) => {
            let reply = session.handle_turn(&message).await;
            println!("{reply}");
            if session.pending_confirmation().is_some() {
                eprintln!("(single-message mode: the pending action was not performed)");
            }
            Ok(())
        }
        None => shell::run_stdio(&mut session).await,
    }
}

async fn list_tools(config: &Config) -> Result<()> {
    let gateway = connect_gateway(config).await?;
    let tools = gateway.list_tools().await?;

    let width = tools.iter().map(|t| t.name.len()).max().unwrap_or(0);
    let mut stdout = std::io::stdout().lock();
    for tool in &tools {
        let marker = if tool.mutating { "confirm" } else { "       " };
        let description = tool.description.lines().next().unwrap_or_default();
        writeln!(stdout, "{:<width$}  {marker}  {description}", tool.name)?;
    }
    writeln!(stdout, "\n{} tools", tools.len())?;
    Ok(())
}

/// Prints the error and, for known startup failures, how to fix it.
fn report_startup_error(err: &anyhow::Error) {
    eprintln!("Error: {err:#}");
    let hint = if let Some(config_error) = err.downcast_ref::<ConfigurationError>() {
        config_error.hint.clone()
    } else {
        err.downcast_ref::<ToolDiscoveryError>()
            .map(|discovery| discovery.hint().to_string())
    };
    if let Some(hint) = hint {
        eprintln!("Hint: {hint}");
    }
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        Cli::command().debug_assert();
    }

    #[test]
    fn chat_is_the_default_command() {
        let cli = Cli::try_parse_from(["inboxclaw"]).expect("bare invocation should parse");
        assert!(cli.command.is_none());
    }

    #[test]
    fn chat_accepts_message_model_and_verbose() {
        let cli = Cli::try_parse_from([
            "inboxclaw",
            "chat",
            "-m",
            "summarize my inbox",
            "--model",
            "gpt-4o",
            "-v",
        ])
        .expect("chat invocation should parse");

        assert!(cli.verbose);
        match cli.command {
            Some(Commands::Chat { message, model }) => {
                assert_eq!(message.as_deref(), Some("summarize my inbox"));
                assert_eq!(model.as_deref(), Some("gpt-4o"));
            }
            other => panic!("expected chat command, got {other:?}"),
        }
    }

    #[test]
    fn model_override_replaces_configured_model() {
        let mut config = Config::default();
        apply_model_override(&mut config, Some("gpt-4o".into())).unwrap();
        assert_eq!(config.provider.model, "gpt-4o");

        let before = config.provider.model.clone();
        apply_model_override(&mut config, None).unwrap();
        assert_eq!(config.provider.model, before);
    }

    #[test]
    fn empty_model_override_is_rejected() {
        let mut config = Config::default();
        let err = apply_model_override(&mut config, Some(String::new())).unwrap_err();
        assert!(err.to_string().contains("model"));

        let err = apply_model_override(&mut config, Some("   ".into())).unwrap_err();
        assert!(err.to_string().contains("model"));
    }

    #[test]
    fn config_dir_is_global() {
        let cli = Cli::try_parse_from(["inboxclaw", "tools", "--config-dir", "/tmp/ic"])
            .expect("tools invocation should parse");
        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/ic")));
        assert!(matches!(cli.command, Some(Commands::Tools)));
    }

    #[test]
    fn completions_cli_parses_supported_shells() {
        for shell in ["bash", "fish", "zsh", "powershell", "elvish"] {
            let cli = Cli::try_parse_from(["inboxclaw", "completions", shell])
                .expect("completions invocation should parse");
            assert!(matches!(cli.command, Some(Commands::Completions { .. })));
        }
    }

    #[test]
    fn completion_generation_mentions_binary_name() {
        let mut output = Vec::new();
        write_shell_completion(CompletionShell::Bash, &mut output)
            .expect("completion generation should succeed");
        let script = String::from_utf8(output).expect("completion output should be valid utf-8");
        assert!(script.contains("inboxclaw"));
    }
}
