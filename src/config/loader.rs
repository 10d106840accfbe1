//! Configuration loading from a JSON file plus environment overrides.

use crate::config::types::{LabError, LabboxConfig, Result, TerminalMode};
use std::path::{Path, PathBuf};

/// Environment variable naming the config file when `--config` is absent
pub const CONFIG_ENV: &str = "LABBOX_CONFIG";

impl LabboxConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LabError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| LabError::Config(format!("Failed to parse config JSON: {}", e)))
    }

    /// Resolve the config source (explicit path, `LABBOX_CONFIG`, or defaults)
    /// and apply environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => {
                log::info!("Loading configuration from {}", path.display());
                Self::load_from_file(path)?
            }
            None => {
                log::debug!("No configuration file given, using defaults");
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("LABBOX_TEMPLATES_PATH") {
            self.provisioning.templates_root = PathBuf::from(path);
        }
        if let Some(path) = lookup("LABBOX_STUDENT_LABS_PATH") {
            self.provisioning.student_labs_root = PathBuf::from(path);
        }
        if let Some(raw) = lookup("LABBOX_ALLOWED_COMMANDS") {
            let commands: Vec<String> = serde_json::from_str(&raw).map_err(|e| {
                LabError::Config(format!(
                    "LABBOX_ALLOWED_COMMANDS must be a JSON array of strings: {}",
                    e
                ))
            })?;
            self.admission.allowed_commands = commands;
        }
        if let Some(mode) = lookup("LABBOX_TERMINAL_MODE") {
            self.terminal.mode = match mode.to_ascii_lowercase().as_str() {
                "pty" => TerminalMode::Pty,
                "fallback" => TerminalMode::Fallback,
                other => {
                    return Err(LabError::Config(format!(
                        "Unknown LABBOX_TERMINAL_MODE '{}' (expected pty or fallback)",
                        other
                    )))
                }
            };
        }
        Ok(())
    }
}
