//! User-selectable options that steer prompt construction.
//!
//! [`RefactorOptions`] is the flat option map the front end produces; every key
//! is optional and a missing key behaves exactly like a falsy one.
//! [`RefactorMenu`] is the catalog of values each option can take.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// What the user wants done with their input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Functionality {
    #[default]
    Refactor,
    #[serde(alias = "write", alias = "write-new-code")]
    WriteNewCode,
    Review,
}

impl Functionality {
    pub fn is_refactor(self) -> bool {
        self == Functionality::Refactor
    }
}

impl std::fmt::Display for Functionality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Functionality::Refactor => write!(f, "Refactor"),
            Functionality::WriteNewCode => write!(f, "Write New Code"),
            Functionality::Review => write!(f, "Review"),
        }
    }
}

impl std::str::FromStr for Functionality {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['_', ' '], "-").as_str() {
            "refactor" => Ok(Functionality::Refactor),
            "write" | "write-new-code" | "writenewcode" | "generate" => {
                Ok(Functionality::WriteNewCode)
            }
            "review" => Ok(Functionality::Review),
            _ => Err(ConfigError::UnknownValue {
                kind: "functionality".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Sampling parameters forwarded to the completion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub temperature: f64,
    pub top_p: f64,
}

impl ModelParameters {
    pub const TEMPERATURE_RANGE: (f64, f64) = (0.01, 5.0);
    pub const TOP_P_RANGE: (f64, f64) = (0.01, 1.0);

    /// Create validated parameters.
    pub fn new(temperature: f64, top_p: f64) -> Result<Self, ConfigError> {
        let params = Self { temperature, top_p };
        params.validate()?;
        Ok(params)
    }

    /// Check both values against their allowed ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("temperature", self.temperature, Self::TEMPERATURE_RANGE)?;
        check_range("top_p", self.top_p, Self::TOP_P_RANGE)
    }
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            top_p: 0.9,
        }
    }
}

fn check_range(field: &str, value: f64, (min, max): (f64, f64)) -> Result<(), ConfigError> {
    // NaN fails both comparisons and is rejected here too.
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field: field.to_string(),
            value,
            min,
            max,
        })
    }
}

/// The option map produced by the front end.
///
/// Every field defaults to its falsy value, so a JSON or TOML map carrying any
/// subset of keys deserializes cleanly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefactorOptions {
    pub programming_language: Option<String>,
    pub optimize_for: Vec<String>,
    pub select_pep_compliance: Vec<String>,
    pub sql_variant: Option<String>,
    pub sql_formatting: bool,
    pub autogenerate_docstring: bool,
    pub docstring_format: Option<String>,
    pub include_type_annotations: bool,
    pub identify_code_smells: bool,
    pub enable_variable_renaming: bool,
    pub suggest_code_organization: bool,
    pub remove_unused_imports: bool,
    pub security_check: bool,
    pub comment_verbosity: Option<String>,
}

impl RefactorOptions {
    /// The option set the sidebar would show for a language, with every toggle on
    /// and every dropdown at its first entry.
    ///
    /// SQL gets variant/formatting options, Python gets PEP compliance, non-SQL
    /// languages get docstrings, type annotations and organization hints, and the
    /// refactor-only checks are enabled only for [`Functionality::Refactor`].
    pub fn defaults_for(
        language: &str,
        functionality: Functionality,
        menu: &RefactorMenu,
    ) -> Self {
        let is_sql = language.eq_ignore_ascii_case("sql");
        let is_python = language.eq_ignore_ascii_case("python");
        let refactor = functionality.is_refactor();

        let mut options = Self {
            programming_language: Some(language.to_string()),
            comment_verbosity: menu.comment_verbosity.first().cloned(),
            ..Self::default()
        };

        if is_sql {
            options.sql_variant = menu.sql_variants.first().cloned();
            options.sql_formatting = true;
        } else {
            options.autogenerate_docstring = true;
            options.docstring_format = menu.docstring_formats.first().cloned();
            options.include_type_annotations = true;
            options.suggest_code_organization = true;
        }
        if is_python {
            options.select_pep_compliance = menu.pep_list.first().cloned().into_iter().collect();
        }
        if refactor {
            options.security_check = true;
            options.identify_code_smells = true;
            options.enable_variable_renaming = true;
            options.remove_unused_imports = !is_sql;
        }
        options
    }

    /// The programming language, if one was chosen.
    pub fn language(&self) -> Option<&str> {
        non_blank(&self.programming_language)
    }

    /// Check every chosen value against the catalog.
    pub fn validate(&self, menu: &RefactorMenu) -> Result<(), ConfigError> {
        check_choice("programming_language", self.language(), &menu.programming_languages)?;
        check_choice("sql_variant", non_blank(&self.sql_variant), &menu.sql_variants)?;
        check_choice(
            "docstring_format",
            non_blank(&self.docstring_format),
            &menu.docstring_formats,
        )?;
        check_choice(
            "comment_verbosity",
            non_blank(&self.comment_verbosity),
            &menu.comment_verbosity,
        )?;
        for target in &self.optimize_for {
            check_choice("optimize_for", Some(target), &menu.optimize_for)?;
        }
        for pep in &self.select_pep_compliance {
            check_choice("select_pep_compliance", Some(pep), &menu.pep_list)?;
        }
        Ok(())
    }

    /// Load options from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = read_file(path)?;
        serde_json::from_str(&text).map_err(|e| ConfigError::ParseError {
            message: format!("{}: {}", path.display(), e),
        })
    }
}

/// Treat `None`, empty, and whitespace-only strings as absent.
pub(crate) fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn check_choice(kind: &str, value: Option<&str>, allowed: &[String]) -> Result<(), ConfigError> {
    match value {
        Some(v) if !allowed.iter().any(|a| a.eq_ignore_ascii_case(v)) => {
            Err(ConfigError::UnknownValue {
                kind: kind.to_string(),
                value: v.to_string(),
            })
        }
        _ => Ok(()),
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ConfigError::FileNotFound {
            path: path.to_path_buf(),
        },
        _ => ConfigError::ParseError {
            message: format!("{}: {}", path.display(), e),
        },
    })
}

/// Catalog of values offered for each option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefactorMenu {
    pub programming_languages: Vec<String>,
    pub optimize_for: Vec<String>,
    pub sql_variants: Vec<String>,
    pub pep_list: Vec<String>,
    pub docstring_formats: Vec<String>,
    pub comment_verbosity: Vec<String>,
}

impl Default for RefactorMenu {
    fn default() -> Self {
        fn strings(values: &[&str]) -> Vec<String> {
            values.iter().map(|v| v.to_string()).collect()
        }
        Self {
            programming_languages: strings(&[
                "Python",
                "SQL",
                "JavaScript",
                "TypeScript",
                "Java",
                "C#",
                "C++",
                "Go",
                "Rust",
            ]),
            optimize_for: strings(&["Performance", "Readability", "Memory", "Maintainability"]),
            sql_variants: strings(&[
                "Snowflake",
                "PostgreSQL",
                "MySQL",
                "SQLite",
                "T-SQL",
                "Oracle",
                "BigQuery",
            ]),
            pep_list: strings(&["PEP 8", "PEP 257", "PEP 484", "PEP 20"]),
            docstring_formats: strings(&["Google", "NumPy", "Sphinx", "reStructuredText"]),
            comment_verbosity: strings(&["Minimal", "Moderate", "Detailed"]),
        }
    }
}

impl RefactorMenu {
    /// Load a catalog from a JSON file. Missing sections fall back to the built-in lists.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = read_file(path)?;
        serde_json::from_str(&text).map_err(|e| ConfigError::ParseError {
            message: format!("{}: {}", path.display(), e),
        })
    }
}
