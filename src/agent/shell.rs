use crate::agent::session::Session;
use anyhow::{Context, Result};
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

pub const GREETING: &str = "Ask me about your email (type 'quit' to exit):";
pub const PROMPT: &str = "> ";

fn is_exit_command(line: &str) -> bool {
    line.eq_ignore_ascii_case("quit") || line.eq_ignore_ascii_case("exit")
}

/// Line-based console loop. Returns on `quit`, `exit` or end of input.
pub async fn run<R, W>(session: &mut Session, input: R, output: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    writeln!(output, "{GREETING}\n").context("Failed to write to console")?;
    let mut lines = input.lines();

    loop {
        write!(output, "{PROMPT}").context("Failed to write to console")?;
        output.flush().context("Failed to flush console")?;

        let Some(line) = lines
            .next_line()
            .await
            .context("Failed to read from console")?
        else {
            break;
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if is_exit_command(line) {
            break;
        }

        let reply = session.handle_turn(line).await;
        writeln!(output, "\n{reply}\n").context("Failed to write to console")?;
    }

    tracing::debug!("Interactive shell finished");
    Ok(())
}

/// [`run`] on the process's stdin/stdout.
pub async fn run_stdio(session: &mut Session) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = std::io::stdout();
    run(session, stdin, &mut stdout).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_commands_are_case_insensitive() {
        assert!(is_exit_command("quit"));
        assert!(is_exit_command("EXIT"));
        assert!(is_exit_command("Quit"));
        assert!(!is_exit_command("quit now"));
        assert!(!is_exit_command("q"));
    }
}
