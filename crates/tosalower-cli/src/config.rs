//! Configuration file support for the tosalower CLI
//!
//! Supports loading configuration from:
//! - A custom path via the TOSALOWER_CONFIG environment variable
//! - .tosalowerrc in the current directory
//! - .tosalowerrc in the user home directory
//!
//! When TOSALOWER_CONFIG is set it names the only file considered, for
//! loading as well as for `config path` and `config init`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tosalower_compiler::CompilationConfig;
use tosalower_ir::TosaSpecification;

pub const CONFIG_FILE: &str = ".tosalowerrc";
pub const CONFIG_ENV: &str = "TOSALOWER_CONFIG";

/// Configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default target specification
    pub spec: String,

    /// Validate the graph after every pass
    pub validate_each_pass: bool,

    /// Check pass ordering when a pipeline is assembled
    pub check_pipeline_ordering: bool,

    /// Passes after which the graph is logged
    pub dump_graph_after: Vec<String>,

    /// Enable colored output
    pub colored: bool,

    /// Default log filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            spec: "TOSA-1.0+INT".to_string(),
            validate_each_pass: false,
            check_pipeline_ordering: true,
            dump_graph_after: Vec::new(),
            colored: true,
            log_level: "warn".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Find and load configuration file
    ///
    /// A file that exists but does not parse is an error; no file at all
    /// gives the defaults.
    pub fn load_default() -> Result<Self> {
        let (env, cwd, home) = search_roots();
        match locate(env, &cwd, home.as_deref()) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Path of the file `load_default` reads, or would read once created
    pub fn config_path() -> PathBuf {
        let (env, cwd, home) = search_roots();
        config_path_in(env, &cwd, home.as_deref())
    }

    /// Create a default configuration file
    pub fn create_default() -> Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            anyhow::bail!("Config file already exists: {}", path.display());
        }
        Self::default().save(&path)?;
        Ok(path)
    }

    /// Compiler options for `spec`, or for the configured target.
    pub fn compilation_config(&self, spec: Option<&str>) -> Result<CompilationConfig> {
        let spec = parse_spec(spec.unwrap_or(&self.spec))?;
        let mut config = CompilationConfig::new(spec)
            .with_validate_each_pass(self.validate_each_pass)
            .with_check_pipeline_ordering(self.check_pipeline_ordering);
        for pass in &self.dump_graph_after {
            config = config.with_dump_graph_after(pass.clone());
        }
        Ok(config)
    }
}

pub fn parse_spec(text: &str) -> Result<TosaSpecification> {
    text.parse()
        .with_context(|| format!("Invalid target specification: {text}"))
}

fn search_roots() -> (Option<PathBuf>, PathBuf, Option<PathBuf>) {
    let env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    (env, cwd, dirs::home_dir())
}

/// Existing configuration file, if any.
///
/// Search order:
/// 1. `env` (from TOSALOWER_CONFIG); when set, nothing else is searched
/// 2. .tosalowerrc in `cwd`
/// 3. .tosalowerrc in `home`
pub fn locate(env: Option<PathBuf>, cwd: &Path, home: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = env {
        return path.is_file().then_some(path);
    }
    let current = cwd.join(CONFIG_FILE);
    if current.is_file() {
        return Some(current);
    }
    home.map(|h| h.join(CONFIG_FILE)).filter(|p| p.is_file())
}

/// The located file, else where a new one goes: `env` when set, otherwise
/// the home directory (the current directory when there is no home).
pub fn config_path_in(env: Option<PathBuf>, cwd: &Path, home: Option<&Path>) -> PathBuf {
    if let Some(path) = env {
        return path;
    }
    locate(None, cwd, home).unwrap_or_else(|| home.unwrap_or(cwd).join(CONFIG_FILE))
}
