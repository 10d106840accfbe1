// Startup configuration validation.
// Hard errors abort startup; warnings are logged and startup continues.

use crate::config::types::{IsolationKind, LabError, LabboxConfig, Result};
use crate::lab::lease::LeasePool;
use crate::observability::audit::events;
use crate::utils::env_hygiene::validate_path_value;

/// Validation result with detailed errors
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate config at startup, failing fast on hard errors
pub fn validate_config(config: &LabboxConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_admission(config, &mut result);
    validate_terminal(config, &mut result);
    validate_principal(config, &mut result);
    validate_provisioning(config, &mut result);

    if !result.is_valid() {
        let details = result.errors.join("\n");
        events::configuration_violation(details.clone());
        return Err(LabError::Config(format!(
            "Config validation failed:\n{}",
            details
        )));
    }

    Ok(result)
}

fn validate_admission(config: &LabboxConfig, result: &mut ValidationResult) {
    let admission = &config.admission;
    if admission.command_timeout_secs == 0 {
        result.add_error("admission.command_timeout_secs cannot be zero".to_string());
    }
    if admission.output_limit_bytes == 0 {
        result.add_error("admission.output_limit_bytes cannot be zero".to_string());
    }
    if admission.enforce_allow_list && admission.allowed_commands.is_empty() {
        result.add_warning(
            "allow-list enforcement is on but the allow-list is empty; every console command will be blocked"
                .to_string(),
        );
    }
    if !admission.enforce_allow_list {
        result.add_warning("allow-list enforcement is disabled".to_string());
    }
}

fn validate_terminal(config: &LabboxConfig, result: &mut ValidationResult) {
    let terminal = &config.terminal;
    if !terminal.shell.is_absolute() {
        result.add_error(format!(
            "terminal.shell must be an absolute path: {}",
            terminal.shell.display()
        ));
    }
    if terminal.read_chunk_bytes == 0 {
        result.add_error("terminal.read_chunk_bytes cannot be zero".to_string());
    }
    if terminal.poll_interval_ms == 0 || terminal.poll_interval_ms > 1000 {
        result.add_error(format!(
            "terminal.poll_interval_ms must be within 1..=1000, got {}",
            terminal.poll_interval_ms
        ));
    }
    if terminal.default_rows == 0 || terminal.default_cols == 0 {
        result.add_error("terminal default size cannot be zero".to_string());
    }
    for warning in validate_path_value(&terminal.secure_path) {
        result.add_warning(format!("terminal.secure_path: {}", warning));
    }
}

fn validate_principal(config: &LabboxConfig, result: &mut ValidationResult) {
    let principal = &config.principal;
    if !principal.home_root.is_absolute() {
        result.add_error(format!(
            "principal.home_root must be absolute: {}",
            principal.home_root.display()
        ));
    }
    if principal.isolation == IsolationKind::SharedAccount {
        result.add_warning(
            "shared-account isolation runs every student as the service account; not for untrusted students"
                .to_string(),
        );
    }
    if !principal.strict_mode {
        result.add_warning("principal strict mode disabled: root principals are tolerated".to_string());
    }
}

fn validate_provisioning(config: &LabboxConfig, result: &mut ValidationResult) {
    let provisioning = &config.provisioning;
    if provisioning.run_command_timeout_secs == 0 {
        result.add_error("provisioning.run_command_timeout_secs cannot be zero".to_string());
    }
    if provisioning.build_timeout_secs == 0 {
        result.add_error("provisioning.build_timeout_secs cannot be zero".to_string());
    }
    if provisioning.templates_root == provisioning.student_labs_root {
        result.add_error(
            "templates_root and student_labs_root must differ; student copies would overwrite templates"
                .to_string(),
        );
    }
    if !provisioning.templates_root.exists() {
        result.add_warning(format!(
            "templates_root {} does not exist yet",
            provisioning.templates_root.display()
        ));
    }
    if let Err(e) = LeasePool::from_specs(&provisioning.leases, provisioning.exclusive_leases) {
        result.add_error(e.to_string());
    }
}
