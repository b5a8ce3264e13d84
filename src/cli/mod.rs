use clap::{Parser, Subcommand};
use resistnet::config::{default_config_path, ResistConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

pub mod identity;
pub mod init_config;
pub mod version;

#[derive(Parser)]
#[command(name = "resistnet")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operator CLI for ResistNet identity scoring and policy", long_about = None)]
pub struct Cli {
    /// Path to config file (default: ~/.local/share/resistnet/config.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch the Human Passport score for an address
    Score {
        /// Wallet address
        address: String,
    },

    /// Show one stamp provider's contribution to an address's score
    Stamp {
        /// Wallet address
        address: String,

        /// Stamp provider (e.g. Github, Twitter)
        provider: String,
    },

    /// List the actions an address is permitted to take
    Permissions {
        /// Wallet address
        address: String,
    },

    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Display version information
    Version,
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Score { address } => {
            let config = load_config(&config_path)?;
            init_logging(&config.logging.level);
            identity::score(&config, &address).await
        }
        Commands::Stamp { address, provider } => {
            let config = load_config(&config_path)?;
            init_logging(&config.logging.level);
            identity::stamp(&config, &address, &provider).await
        }
        Commands::Permissions { address } => {
            let config = load_config(&config_path)?;
            init_logging(&config.logging.level);
            identity::permissions(&config, &address).await
        }
        Commands::InitConfig { force } => init_config::execute(&config_path, force),
        Commands::Version => {
            version::execute();
            Ok(())
        }
    }
}

/// The config file if present, otherwise defaults. Environment overrides
/// apply either way.
fn load_config(path: &std::path::Path) -> Result<ResistConfig, Box<dyn std::error::Error>> {
    if path.exists() {
        return Ok(ResistConfig::load(path)?);
    }
    let mut config = ResistConfig::default();
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Log to stderr. `RUST_LOG` overrides the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parse_score() {
        let cli = Cli::parse_from(["resistnet", "score", "0xAlice"]);
        match cli.command {
            Commands::Score { address } => assert_eq!(address, "0xAlice"),
            _ => panic!("Expected Score command"),
        }
        assert_eq!(cli.config, None);
    }

    #[test]
    fn test_cli_parse_stamp_with_config() {
        let cli = Cli::parse_from([
            "resistnet",
            "stamp",
            "0xalice",
            "Github",
            "--config",
            "/etc/resistnet.toml",
        ]);
        match cli.command {
            Commands::Stamp { address, provider } => {
                assert_eq!(address, "0xalice");
                assert_eq!(provider, "Github");
            }
            _ => panic!("Expected Stamp command"),
        }
        assert_eq!(cli.config, Some("/etc/resistnet.toml".to_string()));
    }

    #[test]
    fn test_cli_parse_permissions() {
        let cli = Cli::parse_from(["resistnet", "permissions", "0xbob"]);
        assert!(matches!(cli.command, Commands::Permissions { .. }));
    }

    #[test]
    fn test_cli_parse_init_config() {
        let cli = Cli::parse_from(["resistnet", "init-config", "--force"]);
        assert!(matches!(cli.command, Commands::InitConfig { force: true }));
    }

    #[test]
    fn test_cli_parse_version() {
        let cli = Cli::parse_from(["resistnet", "version"]);
        assert!(matches!(cli.command, Commands::Version));
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.secrets.node_count, 3);
    }
}
