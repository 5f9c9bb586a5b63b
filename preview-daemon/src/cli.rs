//! Command line interface of the preview node daemon.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "preview-daemon", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file. Defaults to ./preview.config, ~/.preview.config,
    /// then /etc/preview.config.
    #[arg(long, short, global = true, env = "PREVIEW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    pub json_logs: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Starts the render agents and serves until interrupted.
    Run,

    /// Renders one local file and prints the job report.
    Render {
        file: PathBuf,

        /// Seconds to wait for the job to finish.
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },

    /// Prints the effective configuration.
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_parses_render_with_global_config() {
        let cli = Cli::parse_from([
            "preview-daemon",
            "render",
            "slides.pptx",
            "--config",
            "/etc/preview.config",
        ]);
        match cli.command {
            Command::Render { file, timeout } => {
                assert_eq!(file, PathBuf::from("slides.pptx"));
                assert_eq!(timeout, 300);
            }
            other => panic!("expected Render, got {:?}", other),
        }
        assert_eq!(cli.config, Some(PathBuf::from("/etc/preview.config")));
    }

    #[test]
    fn test_requires_subcommand() {
        assert!(Cli::try_parse_from(["preview-daemon"]).is_err());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
