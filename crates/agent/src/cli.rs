use std::path::PathBuf;

use clap::{Parser, Subcommand};
use infrastructure::config::{LogFormat, LogLevel};
use infrastructure::constants::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(
    name = "statewall",
    about = "Stateful packet filter and NAT engine",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "STATEWALL_CONFIG", global = true)]
    pub config: String,

    /// Log level override (takes precedence over config file)
    #[arg(short, long, global = true)]
    pub log_level: Option<LogLevel>,

    /// Log format: json (default, production) or text (development)
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the filter: packets on stdin, verdicts on stdout (default)
    Run,

    /// Validate the configuration and compile the ruleset
    Check,

    /// Run a recorded packet trace through the filter
    Replay {
        /// JSON-lines trace file, one packet record per line
        trace: PathBuf,
    },

    /// Display version and build information
    Version,
}

/// Parse CLI arguments from the process environment.
pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_run() {
        let cli = Cli::try_parse_from(["statewall"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, DEFAULT_CONFIG_PATH);
    }

    #[test]
    fn replay_takes_a_trace_path() {
        let cli =
            Cli::try_parse_from(["statewall", "replay", "trace.jsonl", "-c", "/tmp/sw.yaml"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Replay {
                trace: PathBuf::from("trace.jsonl")
            })
        );
        assert_eq!(cli.config, "/tmp/sw.yaml");
    }

    #[test]
    fn log_overrides_parse() {
        let cli = Cli::try_parse_from([
            "statewall",
            "--log-level",
            "debug",
            "--log-format",
            "text",
            "check",
        ])
        .unwrap();
        assert_eq!(cli.log_level, Some(LogLevel::Debug));
        assert_eq!(cli.log_format, Some(LogFormat::Text));
        assert_eq!(cli.command, Some(Command::Check));
    }

    #[test]
    fn unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["statewall", "frobnicate"]).is_err());
    }
}
