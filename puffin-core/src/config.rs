//! Configuration system for Puffin.
//!
//! Uses `figment` for layered configuration: defaults -> user config -> workspace
//! config -> environment -> CLI overrides. Configuration is loaded from
//! `~/.config/puffin/config.toml` and/or `.puffin/config.toml` in the workspace.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::conversation::DEFAULT_GREETING;
use crate::error::ConfigError;
use crate::options::{Functionality, ModelParameters, RefactorMenu};
use crate::tokenizer::{DEFAULT_ENCODING, TokenBudget};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PuffinConfig {
    pub endpoint: EndpointConfig,
    pub model: ModelParameters,
    pub session: SessionConfig,
    pub options: OptionsConfig,
}

/// Which hosted model to call and how to authenticate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// `replicate` or `mock`.
    pub provider: String,
    /// Replicate model as `owner/name`.
    pub model: String,
    pub base_url: String,
    /// Environment variable holding the API token.
    pub api_token_env: String,
    /// Token set directly in config. Prefer the environment or the keyring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    /// Keyring account key; defaults to the provider name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_store_key: Option<String>,
    /// Template the model wraps the prompt in. `"{prompt}"` passes it through as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
    /// Connect and create-prediction timeout.
    pub timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            provider: "replicate".to_string(),
            model: "snowflake/snowflake-arctic-instruct".to_string(),
            base_url: "https://api.replicate.com/v1".to_string(),
            api_token_env: "REPLICATE_API_TOKEN".to_string(),
            api_token: None,
            credential_store_key: None,
            prompt_template: Some("{prompt}".to_string()),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// First assistant message of every conversation.
    pub greeting: String,
    pub token_budget: TokenBudget,
    /// tiktoken encoding or model name used by the token guard.
    pub tokenizer: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            greeting: DEFAULT_GREETING.to_string(),
            token_budget: TokenBudget::default(),
            tokenizer: DEFAULT_ENCODING.to_string(),
        }
    }
}

/// Startup defaults for the option sidebar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptionsConfig {
    pub functionality: Functionality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub programming_language: Option<String>,
    /// JSON file replacing the built-in option catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub menu_path: Option<PathBuf>,
}

impl OptionsConfig {
    /// The option catalog: `menu_path` if set, otherwise the built-in one.
    pub fn load_menu(&self) -> Result<RefactorMenu, ConfigError> {
        match &self.menu_path {
            Some(path) => RefactorMenu::from_json_file(path),
            None => Ok(RefactorMenu::default()),
        }
    }
}

impl PuffinConfig {
    /// Reject values no session could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.validate()?;
        if self.session.token_budget.limit() == 0 {
            return Err(ConfigError::Invalid {
                message: "session.token_budget must be greater than zero".to_string(),
            });
        }
        if self.endpoint.model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "endpoint.model must not be empty".to_string(),
            });
        }
        if self.endpoint.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "endpoint.timeout_secs must be greater than zero".to_string(),
            });
        }
        match self.endpoint.provider.as_str() {
            "replicate" | "mock" => Ok(()),
            other => Err(ConfigError::UnknownValue {
                kind: "provider".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Values set on the command line. Only the fields that are `Some` override
/// lower layers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    pub endpoint: EndpointOverrides,
    pub model: ModelOverrides,
    pub options: OptionsOverrides,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OptionsOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub functionality: Option<Functionality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub programming_language: Option<String>,
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "puffin", "puffin")
}

/// Path of the user-level config file, if a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".puffin").join("config.toml")
}

/// Load configuration, merging all layers.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<PuffinConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(PuffinConfig::default()));

    if let Some(user_config) = user_config_path().filter(|p| p.exists()) {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // PUFFIN_ENDPOINT__MODEL, PUFFIN_MODEL__TEMPERATURE, ...
    figment = figment.merge(Env::prefixed("PUFFIN_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Whether a user-level or workspace-level config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| workspace_config_path(ws).exists())
}
