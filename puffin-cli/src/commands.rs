//! CLI subcommand handlers.

use crate::AuthAction;
use crate::Commands;
use crate::ConfigAction;
use puffin_core::config::{ConfigOverrides, workspace_config_path};
use puffin_core::credentials::{CredentialStore, KeyringCredentialStore, looks_like_replicate_token};
use puffin_core::{PuffinConfig, RefactorMenu};
use std::path::Path;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    overrides: &ConfigOverrides,
) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace, overrides),
        Commands::Menu => handle_menu(workspace, overrides),
        Commands::Auth { action } => handle_auth(action, workspace, overrides),
    }
}

fn load(workspace: &Path, overrides: &ConfigOverrides) -> anyhow::Result<PuffinConfig> {
    puffin_core::load_config(Some(workspace), Some(overrides))
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    overrides: &ConfigOverrides,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)?;
            }

            let toml_str = toml::to_string_pretty(&PuffinConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let mut config = load(workspace, overrides)?;
            if config.endpoint.api_token.is_some() {
                config.endpoint.api_token = Some("********".to_string());
            }
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

fn handle_menu(workspace: &Path, overrides: &ConfigOverrides) -> anyhow::Result<()> {
    let config = load(workspace, overrides)?;
    let menu = config.options.load_menu()?;
    print!("{}", render_menu(&menu));
    Ok(())
}

fn render_menu(menu: &RefactorMenu) -> String {
    let sections: [(&str, &[String]); 6] = [
        ("Programming languages", &menu.programming_languages),
        ("Optimize for", &menu.optimize_for),
        ("SQL variants", &menu.sql_variants),
        ("PEP compliance", &menu.pep_list),
        ("Docstring formats", &menu.docstring_formats),
        ("Comment verbosity", &menu.comment_verbosity),
    ];
    let mut out = String::new();
    for (title, values) in sections {
        out.push_str(&format!("{}:\n", title));
        for value in values {
            out.push_str(&format!("  - {}\n", value));
        }
    }
    out
}

/// Keyring account key for a provider, honoring `credential_store_key` for the configured one.
fn store_key<'a>(config: &'a PuffinConfig, provider: &'a str) -> &'a str {
    if provider == config.endpoint.provider {
        config
            .endpoint
            .credential_store_key
            .as_deref()
            .unwrap_or(provider)
    } else {
        provider
    }
}

fn handle_auth(
    action: AuthAction,
    workspace: &Path,
    overrides: &ConfigOverrides,
) -> anyhow::Result<()> {
    let config = load(workspace, overrides)?;
    let cred_store = KeyringCredentialStore::new();

    match action {
        AuthAction::Status => {
            let endpoint = &config.endpoint;
            println!("Authentication status:");
            println!();
            let mut sources = Vec::new();
            if endpoint.api_token.as_deref().is_some_and(|t| !t.trim().is_empty()) {
                sources.push("config file".to_string());
            }
            if std::env::var(&endpoint.api_token_env).is_ok_and(|v| !v.trim().is_empty()) {
                sources.push(format!("environment ({})", endpoint.api_token_env));
            }
            if cred_store.has_key(store_key(&config, &endpoint.provider)) {
                sources.push("OS keyring".to_string());
            }
            if sources.is_empty() {
                println!("  {}: not configured", endpoint.provider);
            } else {
                println!("  {}: {}", endpoint.provider, sources.join(", "));
            }
            Ok(())
        }
        AuthAction::Set { provider } => {
            let provider = provider.to_lowercase();
            let token: String = dialoguer::Password::new()
                .with_prompt(format!("Enter your {} API token", provider))
                .interact()?;
            let token = token.trim();
            if token.is_empty() {
                anyhow::bail!("API token must not be empty");
            }
            if provider == "replicate" && !looks_like_replicate_token(token) {
                println!("Warning: this does not look like a Replicate token (expected r8_ prefix).");
            }
            cred_store.store_key(store_key(&config, &provider), token)?;
            println!("Stored API token for {} in the OS keyring.", provider);
            Ok(())
        }
        AuthAction::Remove { provider } => {
            let provider = provider.to_lowercase();
            cred_store.delete_key(store_key(&config, &provider))?;
            println!("Removed stored API token for {}.", provider);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_menu_lists_every_section() {
        let text = render_menu(&RefactorMenu::default());
        assert!(text.starts_with("Programming languages:\n  - Python\n"));
        assert!(text.contains("SQL variants:\n  - Snowflake\n"));
        assert!(text.contains("Comment verbosity:\n  - Minimal\n"));
    }

    #[test]
    fn test_store_key_uses_configured_override() {
        let mut config = PuffinConfig::default();
        assert_eq!(store_key(&config, "replicate"), "replicate");
        config.endpoint.credential_store_key = Some("work-replicate".into());
        assert_eq!(store_key(&config, "replicate"), "work-replicate");
        assert_eq!(store_key(&config, "other"), "other");
    }

    #[tokio::test]
    async fn test_config_init_writes_loadable_file() {
        let dir = tempfile::tempdir().unwrap();
        handle_command(
            Commands::Config {
                action: ConfigAction::Init,
            },
            dir.path(),
            &ConfigOverrides::default(),
        )
        .await
        .unwrap();

        let path = workspace_config_path(dir.path());
        assert!(path.exists());
        let config = load(dir.path(), &ConfigOverrides::default()).unwrap();
        assert_eq!(config.endpoint.provider, "replicate");
    }
}
