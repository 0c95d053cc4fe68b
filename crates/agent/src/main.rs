#![forbid(unsafe_code)]

mod cli;
mod commands;
mod reload;
mod shutdown;
mod startup;
mod trace;

use anyhow::Result;
use infrastructure::config::LogLevel;
use infrastructure::logging::init_logging;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::parse();

    match cli.command {
        Some(Command::Version) => {
            println!("statewall {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }

        Some(Command::Check) => {
            init_cli_logging(&cli)?;
            commands::cmd_check(&cli.config, &mut std::io::stdout().lock())
                .await
                .map(|_| ())
        }

        Some(Command::Replay { ref trace }) => {
            init_cli_logging(&cli)?;
            let packets =
                commands::cmd_replay(&cli.config, trace, &mut std::io::stdout().lock()).await?;
            tracing::info!(packets, "replay finished");
            Ok(())
        }

        Some(Command::Run) | None => startup::run(&cli).await,
    }
}

/// One-shot commands keep stdout for their output and log warnings only,
/// unless the command line asks for more.
fn init_cli_logging(cli: &Cli) -> Result<()> {
    init_logging(
        cli.log_level.unwrap_or(LogLevel::Warn),
        cli.log_format.unwrap_or(infrastructure::config::LogFormat::Text),
    )?;
    Ok(())
}
