//! Configuration module for Overcast.
//!
//! Typed configuration structs mapping to the YAML configuration file,
//! with loading, validation, defaults, and a builder for programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for Overcast.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tree: TreeConfig,
    pub transfers: TransfersConfig,
    pub logging: LoggingConfig,
}

/// Remote tree building settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Levels below the root built by `init_tree`. `0` lists the root only.
    pub default_depth: i32,
    /// Use the provider's bulk metadata fetch for key-only listings when it has one.
    pub batch_metadata: bool,
}

/// Upload / download settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransfersConfig {
    /// Minimum progress delta between two IN_PROGRESS notifications, in `[0.0, 1.0)`.
    pub progress_step: f32,
    /// Overwrite flag applied by callers that don't pass one explicitly.
    pub overwrite_by_default: bool,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/overcast/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("overcast")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            default_depth: 1,
            batch_metadata: true,
        }
    }
}

impl Default for TransfersConfig {
    fn default() -> Self {
        Self {
            progress_step: 0.01,
            overwrite_by_default: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"tree.default_depth"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- tree ---
        if self.tree.default_depth < 0 {
            errors.push(ValidationError {
                field: "tree.default_depth".into(),
                message: "must be 0 or greater".into(),
            });
        }

        // --- transfers ---
        let step = self.transfers.progress_step;
        if !step.is_finite() || !(0.0..1.0).contains(&step) {
            errors.push(ValidationError {
                field: "transfers.progress_step".into(),
                message: format!("must be in [0.0, 1.0), got {step}"),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "must be one of {:?}, got \"{}\"",
                    VALID_LOG_LEVELS, self.logging.level
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust
/// use overcast_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .tree_default_depth(3)
///     .logging_level("debug")
///     .build();
/// assert_eq!(config.tree.default_depth, 3);
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- tree ---

    pub fn tree_default_depth(mut self, depth: i32) -> Self {
        self.config.tree.default_depth = depth;
        self
    }

    pub fn tree_batch_metadata(mut self, enabled: bool) -> Self {
        self.config.tree.batch_metadata = enabled;
        self
    }

    // --- transfers ---

    pub fn transfers_progress_step(mut self, step: f32) -> Self {
        self.config.transfers.progress_step = step;
        self
    }

    pub fn transfers_overwrite_by_default(mut self, overwrite: bool) -> Self {
        self.config.transfers.overwrite_by_default = overwrite;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
