//! Puffin CLI: refactor, write, and review code with a hosted model from the terminal.
//!
//! Provides both single-turn and interactive REPL modes.

mod commands;
mod repl;

use clap::Parser;
use puffin_core::config::{ConfigOverrides, EndpointOverrides, ModelOverrides, OptionsOverrides};
use puffin_core::{ConversationController, Functionality, KeyringCredentialStore, RefactorOptions};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Puffin: refactor, write, and review code with a hosted language model
#[derive(Parser, Debug)]
#[command(name = "puffin", version, about, long_about = None)]
struct Cli {
    /// File with code or requirements (`-` reads stdin; starts the REPL if omitted)
    input: Option<PathBuf>,

    /// What to do: refactor, write-new-code, review
    #[arg(short, long)]
    functionality: Option<Functionality>,

    /// Programming language of the input
    #[arg(short, long)]
    language: Option<String>,

    /// JSON file with refactor options
    #[arg(long)]
    options: Option<PathBuf>,

    /// Sampling temperature (0.01 to 5.0)
    #[arg(long)]
    temperature: Option<f64>,

    /// Nucleus sampling probability (0.01 to 1.0)
    #[arg(long)]
    top_p: Option<f64>,

    /// Replicate model as owner/name
    #[arg(short, long)]
    model: Option<String>,

    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Use the offline mock endpoint instead of a hosted model
    #[arg(long)]
    mock: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            endpoint: EndpointOverrides {
                provider: self.mock.then(|| "mock".to_string()),
                model: self.model.clone(),
            },
            model: ModelOverrides {
                temperature: self.temperature,
                top_p: self.top_p,
            },
            options: OptionsOverrides {
                functionality: self.functionality,
                programming_language: self.language.clone(),
            },
        }
    }
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List the values each refactor option accepts
    Menu,
    /// Manage the API token stored in the OS keyring
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default workspace configuration file
    Init,
    /// Show the effective configuration
    Show,
}

#[derive(clap::Subcommand, Debug)]
enum AuthAction {
    /// Show where the API token for each provider comes from
    Status,
    /// Store an API token in the OS keyring
    Set {
        /// Provider name
        #[arg(default_value = "replicate")]
        provider: String,
    },
    /// Remove a stored API token
    Remove {
        /// Provider name
        #[arg(default_value = "replicate")]
        provider: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Human-readable stderr plus JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "puffin", "puffin")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "puffin.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let overrides = cli.overrides();

    if let Some(command) = cli.command {
        return commands::handle_command(command, &workspace, &overrides).await;
    }

    let config = puffin_core::load_config(Some(&workspace), Some(&overrides))
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if !puffin_core::config::config_exists(Some(&workspace)) {
        tracing::debug!("No configuration file found, using defaults");
    }

    let store = KeyringCredentialStore::new();
    let mut controller = ConversationController::from_config(&config, Some(&store))?;

    if let Some(path) = &cli.options {
        let options = RefactorOptions::from_json_file(path)?;
        let menu = config.options.load_menu()?;
        controller.set_options_checked(options, &menu)?;
    }

    match cli.input {
        Some(input) => repl::run_single_turn(&input, controller).await,
        None => repl::run_interactive(controller, &config, &workspace).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_become_overrides() {
        let cli = Cli::try_parse_from([
            "puffin",
            "--functionality",
            "review",
            "--language",
            "SQL",
            "--temperature",
            "0.7",
            "--mock",
            "query.sql",
        ])
        .unwrap();
        assert_eq!(cli.input, Some(PathBuf::from("query.sql")));

        let overrides = cli.overrides();
        assert_eq!(overrides.endpoint.provider.as_deref(), Some("mock"));
        assert_eq!(overrides.model.temperature, Some(0.7));
        assert_eq!(overrides.model.top_p, None);
        assert_eq!(overrides.options.functionality, Some(Functionality::Review));
        assert_eq!(overrides.options.programming_language.as_deref(), Some("SQL"));
    }

    #[test]
    fn test_unknown_functionality_rejected() {
        assert!(Cli::try_parse_from(["puffin", "--functionality", "golf"]).is_err());
    }

    #[test]
    fn test_auth_defaults_to_replicate() {
        let cli = Cli::try_parse_from(["puffin", "auth", "set"]).unwrap();
        match cli.command {
            Some(Commands::Auth {
                action: AuthAction::Set { provider },
            }) => assert_eq!(provider, "replicate"),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
