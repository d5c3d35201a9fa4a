//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Pacer - delayed task scheduler with rate-limited execution
#[derive(Parser)]
#[command(
    name = "pacer",
    about = "Delayed task scheduler with token-bucket rate limiting",
    version,
    after_help = "Logs are written to: ~/.local/share/pacer/logs/pacer.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Schedule a batch of demo tasks and run them to completion
    Run {
        /// Delay in milliseconds for one task (repeat for more tasks)
        #[arg(short = 't', long = "task", value_name = "DELAY_MS", required = true)]
        delays: Vec<u64>,

        /// Make the task at this 1-based index fail (repeatable)
        #[arg(long = "fail", value_name = "INDEX")]
        fail: Vec<usize>,

        /// Override bucket capacity
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Override refill rate (tasks per second)
        #[arg(short, long)]
        rate: Option<f64>,

        /// Abandon pending tasks at shutdown instead of draining
        #[arg(long)]
        no_drain: bool,

        /// Stop after this many milliseconds even if tasks are still pending
        #[arg(long, value_name = "MS")]
        deadline_ms: Option<u64>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the effective configuration
    Config {
        /// Output format (text prints YAML)
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Output format for run/config commands
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" | "yaml" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_no_command() {
        let cli = Cli::parse_from(["pacer"]);
        assert!(cli.command.is_none());
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::parse_from([
            "pacer", "run", "-t", "1000", "-t", "500", "--fail", "2", "--rate", "2", "--no-drain", "-f", "json",
        ]);
        match cli.command {
            Some(Command::Run {
                delays,
                fail,
                max_tokens,
                rate,
                no_drain,
                deadline_ms,
                format,
            }) => {
                assert_eq!(delays, vec![1000, 500]);
                assert_eq!(fail, vec![2]);
                assert_eq!(max_tokens, None);
                assert_eq!(rate, Some(2.0));
                assert!(no_drain);
                assert_eq!(deadline_ms, None);
                assert_eq!(format, OutputFormat::Json);
            }
            other => panic!("expected run command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_run_requires_tasks() {
        assert!(Cli::try_parse_from(["pacer", "run"]).is_err());
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from(["pacer", "config", "-l", "debug", "-c", "/tmp/pacer.yml"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/pacer.yml")));
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("yaml".parse::<OutputFormat>(), Ok(OutputFormat::Text));
        assert!("table".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::Json.to_string(), "json");
    }
}
