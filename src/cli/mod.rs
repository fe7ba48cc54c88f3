//! Command-line surface (§10.3): the `serve` subcommand runs the
//! downstream-facing broker; the rest are operator tooling around it.

mod commands;

use std::io::IsTerminal;

use clap::Parser;
use tracing::Level;

pub use commands::Command;

/// `ica-mcp-proxy` - local multiplexing broker for the Model Context
/// Protocol.
///
/// Aggregates upstream MCP servers behind one stdio session, handling
/// config merging, OAuth, and tool-catalogue mirroring so a single
/// downstream client can reach every configured upstream.
#[derive(Parser, Debug)]
#[command(name = "ica-mcp-proxy", version, about, author)]
pub struct Cli {
    /// Subcommand to execute; `serve` if omitted.
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Enable verbose logging (-v, -vv for trace-level detail).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, global = true)]
    pub no_color: bool,
}

impl Cli {
    /// Run the selected subcommand (`serve` by default), after
    /// initializing logging and color.
    pub async fn execute(self) -> crate::error::BrokerResult<()> {
        self.init_tracing();
        if self.no_color || !std::io::stdout().is_terminal() {
            colored::control::set_override(false);
        }

        self.command.unwrap_or(Command::Serve).execute().await
    }

    /// Initialize the `tracing-subscriber` `EnvFilter`, honoring
    /// `RUST_LOG` when set and otherwise mapping `-v`/`-q` to a level
    /// (§10.1).
    fn init_tracing(&self) {
        let default_directive = if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        };

        let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_serve_when_no_subcommand_given() {
        let cli = Cli::try_parse_from(["ica-mcp-proxy"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn parses_token_subcommand_with_server_argument() {
        let cli = Cli::try_parse_from(["ica-mcp-proxy", "token", "demo"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Token { server }) if server == "demo"));
    }

    #[test]
    fn verbosity_flag_accumulates() {
        let cli = Cli::try_parse_from(["ica-mcp-proxy", "-vv", "servers"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }
}
