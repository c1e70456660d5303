pub mod ask;
pub mod config;

use clap::{Parser, Subcommand};

/// threadmind: LLM bots for team chat.
#[derive(Debug, Parser)]
#[command(name = "threadmind", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Send one direct message to a bot and print its answer.
    Ask {
        /// The message to send.
        message: String,
        /// Bot name (defaults to the default bot).
        #[arg(long)]
        bot: Option<String>,
        /// Run every tool the bot asks for instead of rejecting them.
        #[arg(long)]
        approve_tools: bool,
    },
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path in `THREADMIND_CONFIG` (or
/// `threadmind.toml`). A missing file yields the defaults. Returns the
/// parsed [`Config`](tm_domain::config::Config) and the path that was used.
pub fn load_config() -> anyhow::Result<(tm_domain::config::Config, String)> {
    let config_path = std::env::var("THREADMIND_CONFIG").unwrap_or_else(|_| "threadmind.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        tm_domain::config::Config::default()
    };

    Ok((config, config_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ask() {
        let cli = Cli::try_parse_from(["threadmind", "ask", "--bot", "matty", "--approve-tools", "hi"]).unwrap();
        match cli.command {
            Command::Ask {
                message,
                bot,
                approve_tools,
            } => {
                assert_eq!(message, "hi");
                assert_eq!(bot.as_deref(), Some("matty"));
                assert!(approve_tools);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_config_subcommands() {
        let cli = Cli::try_parse_from(["threadmind", "config", "validate"]).unwrap();
        assert!(matches!(cli.command, Command::Config(ConfigCommand::Validate)));
        assert!(Cli::try_parse_from(["threadmind"]).is_err());
    }
}
