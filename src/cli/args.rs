//! Command line argument parsing
//!
//! Subcommands:
//! - `sessions list`: List persisted sessions
//! - `sessions backup`: Mirror one session to remote storage
//! - `sessions restore`: Restore one session from remote storage
//! - `sessions delete`: Delete one session everywhere
//! - `sessions cleanup`: Remove sessions unused for longer than a max age
//! - `config show`: Show configuration discovery information
//! - `config init`: Write a default user configuration file

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub user_id: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    ListSessions,
    Backup(SessionTarget),
    Restore {
        target: SessionTarget,
        into: Option<PathBuf>,
    },
    Delete(SessionTarget),
    Cleanup { max_age: Duration },
    ShowConfig,
    InitConfig,
}

#[derive(Debug, Parser)]
#[command(name = "wagw")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Manage persisted messaging gateway sessions")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path (skips discovery)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Inspect and maintain persisted sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum SessionCommands {
    /// List persisted sessions
    List,
    /// Encrypt and upload a session to remote storage
    Backup {
        user_id: String,
        phone: String,
    },
    /// Download and decrypt a session from remote storage
    Restore {
        user_id: String,
        phone: String,
        /// Target directory (defaults to the session's own directory)
        #[arg(long = "into", value_name = "DIR")]
        into: Option<PathBuf>,
    },
    /// Delete a session locally and remotely
    Delete {
        user_id: String,
        phone: String,
    },
    /// Remove sessions unused for longer than the given age
    Cleanup {
        #[arg(long = "max-age-hours", default_value_t = 24 * 7)]
        max_age_hours: u64,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Show configuration discovery information and the effective configuration
    Show,
    /// Create a default configuration file in the user's home directory
    Init,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        let target = |user_id: &String, phone: &String| SessionTarget {
            user_id: user_id.clone(),
            phone: phone.clone(),
        };

        match &self.command {
            Some(Commands::Sessions { command }) => match command {
                SessionCommands::List => Ok(ExecutionMode::ListSessions),
                SessionCommands::Backup { user_id, phone } => {
                    Ok(ExecutionMode::Backup(target(user_id, phone)))
                }
                SessionCommands::Restore {
                    user_id,
                    phone,
                    into,
                } => Ok(ExecutionMode::Restore {
                    target: target(user_id, phone),
                    into: into.clone(),
                }),
                SessionCommands::Delete { user_id, phone } => {
                    Ok(ExecutionMode::Delete(target(user_id, phone)))
                }
                SessionCommands::Cleanup { max_age_hours } => {
                    if *max_age_hours == 0 {
                        return Err("--max-age-hours must be at least 1".to_string());
                    }
                    Ok(ExecutionMode::Cleanup {
                        max_age: Duration::from_secs(max_age_hours * 3600),
                    })
                }
            },
            Some(Commands::Config { command }) => match command {
                ConfigCommands::Show => Ok(ExecutionMode::ShowConfig),
                ConfigCommands::Init => Ok(ExecutionMode::InitConfig),
            },
            None => Err(
                "No command specified. Use 'wagw --help' to see available commands.".to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode_of(argv: &[&str]) -> Result<ExecutionMode, String> {
        Args::try_parse_from(argv).unwrap().mode()
    }

    #[test]
    fn test_session_commands() {
        assert_eq!(
            mode_of(&["wagw", "sessions", "list"]).unwrap(),
            ExecutionMode::ListSessions
        );
        assert_eq!(
            mode_of(&["wagw", "sessions", "backup", "alice", "+15550001111"]).unwrap(),
            ExecutionMode::Backup(SessionTarget {
                user_id: "alice".to_string(),
                phone: "+15550001111".to_string(),
            })
        );
        assert!(matches!(
            mode_of(&["wagw", "sessions", "restore", "alice", "+15550001111", "--into", "/tmp/x"])
                .unwrap(),
            ExecutionMode::Restore { into: Some(_), .. }
        ));
    }

    #[test]
    fn test_cleanup_max_age() {
        assert_eq!(
            mode_of(&["wagw", "sessions", "cleanup", "--max-age-hours", "2"]).unwrap(),
            ExecutionMode::Cleanup {
                max_age: Duration::from_secs(7200)
            }
        );
        assert_eq!(
            mode_of(&["wagw", "sessions", "cleanup"]).unwrap(),
            ExecutionMode::Cleanup {
                max_age: Duration::from_secs(7 * 24 * 3600)
            }
        );
        assert!(mode_of(&["wagw", "sessions", "cleanup", "--max-age-hours", "0"]).is_err());
    }

    #[test]
    fn test_global_config_flag() {
        let args =
            Args::try_parse_from(["wagw", "config", "show", "--config", "/etc/gw.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/gw.toml")));
        assert_eq!(args.mode().unwrap(), ExecutionMode::ShowConfig);
    }

    #[test]
    fn test_missing_arguments_rejected() {
        assert!(Args::try_parse_from(["wagw", "sessions", "backup", "alice"]).is_err());
        assert!(Args::try_parse_from(["wagw", "sessions", "explode"]).is_err());
    }
}
