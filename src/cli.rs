use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sessionizer", version, about = "Analytics session assembly")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run receiver and worker in one process (default)
    Server,

    /// Accept hits over HTTP and publish them to the queue
    Receiver,

    /// Consume hit tasks and assemble sessions
    Worker,

    /// Create or upgrade the session database schema
    Migrate,

    /// Print the warehouse table definition for the session schema
    Columns,

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Display the effective configuration
    Show,

    /// Validate configuration file
    Validate,

    /// List every setting with its environment variable and default
    Docs,
}

impl Cli {
    /// Get the command to execute, defaulting to Server if none provided
    pub fn get_command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_server() {
        let cli = Cli {
            config: PathBuf::from("config.toml"),
            command: None,
        };

        assert!(matches!(cli.get_command(), Commands::Server));
    }

    #[test]
    fn test_cli_parsing_worker_with_config() {
        let args = vec!["sessionizer", "worker", "--config", "/etc/sessionizer.toml"];
        let cli = Cli::try_parse_from(args).unwrap();

        assert!(matches!(cli.get_command(), Commands::Worker));
        assert_eq!(cli.config, PathBuf::from("/etc/sessionizer.toml"));
    }

    #[test]
    fn test_cli_parsing_config_show() {
        let args = vec!["sessionizer", "config", "show"];
        let cli = Cli::try_parse_from(args).unwrap();

        match cli.get_command() {
            Commands::Config { action } => {
                assert!(matches!(action, ConfigCommands::Show));
            }
            _ => panic!("Expected Config command"),
        }
    }

    #[test]
    fn test_cli_parsing_config_docs() {
        let cli = Cli::try_parse_from(vec!["sessionizer", "config", "docs"]).unwrap();
        assert!(matches!(
            cli.get_command(),
            Commands::Config {
                action: ConfigCommands::Docs
            }
        ));
    }

    #[test]
    fn test_cli_rejects_unknown_command() {
        assert!(Cli::try_parse_from(vec!["sessionizer", "replay"]).is_err());
    }
}
