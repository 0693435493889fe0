use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "promptgate")]
#[command(about = "OpenAI-compatible LLM gateway with prompt templates and provider fallback")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a chat-completion request through the configured providers
    Complete {
        /// Request JSON file, `-` for stdin
        request: PathBuf,

        /// Fallback directive JSON file
        #[arg(short, long)]
        fallback: Option<PathBuf>,

        /// Stream the answer as server-sent events
        #[arg(short, long)]
        stream: bool,
    },

    /// Show the upstream request a chat-completion request turns into
    Render {
        /// Request JSON file, `-` for stdin
        request: PathBuf,

        /// Fallback directive JSON file
        #[arg(short, long)]
        fallback: Option<PathBuf>,
    },

    /// Run a request against scripted providers instead of real upstreams
    Simulate {
        /// Request JSON file, `-` for stdin
        request: PathBuf,

        /// Outcome script: provider kind -> list of outcomes
        #[arg(long)]
        script: PathBuf,

        /// Fallback directive JSON file
        #[arg(short, long)]
        fallback: Option<PathBuf>,

        /// Stream the answer as server-sent events
        #[arg(short, long)]
        stream: bool,
    },

    /// Load and validate the configuration, then list the prompts
    CheckConfig,

    /// Write a sample configuration file
    InitConfig {
        /// Destination (defaults to the per-user config file)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate() {
        let cli = Cli::parse_from([
            "promptgate",
            "--debug",
            "simulate",
            "req.json",
            "--script",
            "script.json",
            "--stream",
        ]);
        assert!(cli.debug);
        match cli.command {
            Commands::Simulate { request, script, stream, fallback } => {
                assert_eq!(request, PathBuf::from("req.json"));
                assert_eq!(script, PathBuf::from("script.json"));
                assert!(stream);
                assert!(fallback.is_none());
            }
            _ => panic!("expected simulate"),
        }
    }
}
