//! Command line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Headless launcher for HappinessMP dedicated servers
#[derive(Parser, Debug)]
#[command(name = "hmp-launcher", version, about)]
pub struct Cli {
    /// Directory holding launcher.toml, the roster and crash reports
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Supervise every registered server until Ctrl-C (default)
    Run,
    /// Register a server installation by its executable
    Add {
        /// Path to the server executable
        exe: PathBuf,
        /// Start the server whenever the launcher runs
        #[arg(long)]
        auto_start: bool,
        /// Restart on crash and when the restart timer runs out
        #[arg(long)]
        auto_restart: bool,
    },
    /// Forget a registered server (files are left alone)
    Remove {
        /// Instance id or a unique prefix of it
        id: String,
    },
    /// Show registered servers
    List,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn arguments_are_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_is_the_default() {
        let cli = Cli::try_parse_from(["hmp-launcher", "--data-dir", "/tmp/hmp"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/hmp")));

        let cli = Cli::try_parse_from(["hmp-launcher", "add", "/srv/hmp/server", "--auto-restart"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Add {
                ref exe,
                auto_start: false,
                auto_restart: true,
            }) if exe.as_path() == std::path::Path::new("/srv/hmp/server")
        ));
    }
}
