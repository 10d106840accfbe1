/// Security and audit event logging for labbox
/// Every admission decision, session lifecycle transition, principal change and
/// grading result is written as one JSON line to the audit trail and echoed
/// through the `log` facade at a severity-mapped level.
use crate::config::types::{LabError, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

/// Security event severity levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SecuritySeverity {
    Critical,
    High,
    Medium,
    Low,
}

/// Types of audit events we track
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SecurityEventType {
    // Admission
    CommandExecuted,
    CommandBlocked,
    CommandTimeout,
    PathTraversalAttempt,

    // Terminal lifecycle
    SessionOpened,
    SessionClosed,
    SessionFailed,

    // Principals
    PrincipalCreated,
    PrincipalDestroyed,
    PrincipalDegraded,

    // Provisioning
    LeaseCheckout,
    LeaseReleased,
    ProvisioningWarning,
    LabStarted,
    LabStopped,

    // Grading
    SubmissionGraded,
    SubmissionRejected,

    ConfigurationViolation,
}

impl SecurityEventType {
    /// Get the default severity for this event type
    pub fn default_severity(&self) -> SecuritySeverity {
        match self {
            SecurityEventType::CommandExecuted => SecuritySeverity::Low,
            SecurityEventType::CommandBlocked => SecuritySeverity::Medium,
            SecurityEventType::CommandTimeout => SecuritySeverity::Medium,
            SecurityEventType::PathTraversalAttempt => SecuritySeverity::High,

            SecurityEventType::SessionOpened => SecuritySeverity::Low,
            SecurityEventType::SessionClosed => SecuritySeverity::Low,
            SecurityEventType::SessionFailed => SecuritySeverity::Medium,

            SecurityEventType::PrincipalCreated => SecuritySeverity::Low,
            SecurityEventType::PrincipalDestroyed => SecuritySeverity::Medium,
            SecurityEventType::PrincipalDegraded => SecuritySeverity::High,

            SecurityEventType::LeaseCheckout => SecuritySeverity::Low,
            SecurityEventType::LeaseReleased => SecuritySeverity::Low,
            SecurityEventType::ProvisioningWarning => SecuritySeverity::Medium,
            SecurityEventType::LabStarted => SecuritySeverity::Low,
            SecurityEventType::LabStopped => SecuritySeverity::Low,

            SecurityEventType::SubmissionGraded => SecuritySeverity::Low,
            SecurityEventType::SubmissionRejected => SecuritySeverity::Medium,

            SecurityEventType::ConfigurationViolation => SecuritySeverity::Critical,
        }
    }
}

/// Individual audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub timestamp: DateTime<Utc>,
    pub details: String,

    pub session_id: Option<String>,
    pub principal: Option<String>,
    pub command: Option<String>,
    pub file_path: Option<String>,
    pub exit_code: Option<i32>,
}

impl SecurityEvent {
    /// Create a new security event with default severity
    pub fn new(event_type: SecurityEventType, details: String) -> Self {
        let severity = event_type.default_severity();
        Self {
            event_type,
            severity,
            timestamp: Utc::now(),
            details,
            session_id: None,
            principal: None,
            command: None,
            file_path: None,
            exit_code: None,
        }
    }

    /// Builder pattern methods for optional fields
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_file_path(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    fn to_json_line(&self) -> serde_json::Value {
        let mut entry = serde_json::json!({
            "timestamp": self.timestamp.to_rfc3339(),
            "event_type": self.event_type,
            "severity": self.severity,
            "details": self.details,
            "process_id": std::process::id(),
        });

        if let Some(session_id) = &self.session_id {
            entry["session_id"] = serde_json::json!(session_id);
        }
        if let Some(principal) = &self.principal {
            entry["principal"] = serde_json::json!(principal);
        }
        if let Some(command) = &self.command {
            entry["command"] = serde_json::json!(command);
        }
        if let Some(file_path) = &self.file_path {
            entry["file_path"] = serde_json::json!(file_path);
        }
        if let Some(exit_code) = self.exit_code {
            entry["exit_code"] = serde_json::json!(exit_code);
        }
        entry
    }
}

fn echo_to_log(event: &SecurityEvent) {
    match event.severity {
        SecuritySeverity::Critical => {
            error!("AUDIT CRITICAL: {:?} - {}", event.event_type, event.details)
        }
        SecuritySeverity::High => error!("AUDIT HIGH: {:?} - {}", event.event_type, event.details),
        SecuritySeverity::Medium => warn!("AUDIT: {:?} - {}", event.event_type, event.details),
        SecuritySeverity::Low => info!("AUDIT: {:?} - {}", event.event_type, event.details),
    }
}

/// Audit logger writing JSON lines to an append-only file
pub struct SecurityLogger {
    audit_file: Arc<Mutex<File>>,
    audit_path: PathBuf,
}

impl SecurityLogger {
    /// Create a new security logger
    pub fn new(audit_path: Option<PathBuf>) -> Result<Self> {
        let audit_path = audit_path
            .unwrap_or_else(|| std::env::temp_dir().join("labbox").join("audit.log"));

        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LabError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)
            .map_err(|e| LabError::Config(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            audit_file: Arc::new(Mutex::new(audit_file)),
            audit_path,
        })
    }

    /// Log an audit event
    pub fn log_security_event(&self, event: SecurityEvent) {
        let entry = event.to_json_line();
        echo_to_log(&event);

        if let Ok(mut file) = self.audit_file.lock() {
            if let Err(e) = writeln!(file, "{}", entry) {
                error!("Failed to write to audit log: {}", e);
            }
            if let Err(e) = file.flush() {
                error!("Failed to flush audit log: {}", e);
            }
        } else {
            error!("Failed to acquire lock on audit file");
        }
    }

    /// Get the audit log file path
    pub fn audit_path(&self) -> &PathBuf {
        &self.audit_path
    }
}

/// Global security logger instance
static SECURITY_LOGGER: OnceLock<SecurityLogger> = OnceLock::new();

/// Initialize the global security logger
pub fn init_security_logger(audit_path: Option<PathBuf>) -> Result<()> {
    match SecurityLogger::new(audit_path.clone()) {
        Ok(logger) => {
            if SECURITY_LOGGER.set(logger).is_err() {
                error!("Security logger already initialized");
            } else {
                info!("Security logger initialized");
            }
        }
        Err(e) => {
            // An explicit path that cannot be opened is a configuration error.
            if audit_path.is_some() {
                error!("Failed to initialize security logger: {}", e);
                return Err(e);
            }

            let fallback_paths = vec![
                std::env::temp_dir().join(format!("labbox-audit-{}.log", nix::unistd::geteuid())),
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(std::env::temp_dir)
                    .join(".labbox")
                    .join("audit.log"),
            ];

            for fallback in fallback_paths {
                match SecurityLogger::new(Some(fallback.clone())) {
                    Ok(logger) => {
                        if SECURITY_LOGGER.set(logger).is_err() {
                            error!("Security logger already initialized");
                        } else {
                            warn!(
                                "Security logger initialized using fallback path: {}",
                                fallback.display()
                            );
                        }
                        return Ok(());
                    }
                    Err(fallback_err) => {
                        warn!(
                            "Failed to initialize fallback security logger at {}: {}",
                            fallback.display(),
                            fallback_err
                        );
                    }
                }
            }

            warn!(
                "Security logger unavailable (all paths failed). Continuing with stderr-only audit events: {}",
                e
            );
        }
    }
    Ok(())
}

/// Path of the active audit file, if file-backed logging is running
pub fn audit_path() -> Option<PathBuf> {
    SECURITY_LOGGER.get().map(|logger| logger.audit_path().clone())
}

/// Log a security event using the global logger
pub fn log_security_event(event: SecurityEvent) {
    if let Some(logger) = SECURITY_LOGGER.get() {
        logger.log_security_event(event);
    } else {
        echo_to_log(&event);
    }
}

/// Convenience functions for common audit events
pub mod events {
    use super::*;

    /// An admitted command finished (or failed to run)
    pub fn command_executed(session_id: &str, principal: &str, command: &str, exit_code: i32) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::CommandExecuted,
                format!("Command executed with exit code {}", exit_code),
            )
            .with_session_id(session_id)
            .with_principal(principal)
            .with_command(command)
            .with_exit_code(exit_code),
        );
    }

    /// Admission rejected a command
    pub fn command_blocked(session_id: &str, principal: &str, command: &str, reason: &str) {
        let event_type = if reason.starts_with("Access denied to path") {
            SecurityEventType::PathTraversalAttempt
        } else {
            SecurityEventType::CommandBlocked
        };
        log_security_event(
            SecurityEvent::new(event_type, format!("Blocked command: {}", reason))
                .with_session_id(session_id)
                .with_principal(principal)
                .with_command(command),
        );
    }

    pub fn command_timeout(session_id: &str, principal: &str, command: &str, secs: u64) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::CommandTimeout,
                format!("Command killed after {}s", secs),
            )
            .with_session_id(session_id)
            .with_principal(principal)
            .with_command(command)
            .with_exit_code(124),
        );
    }

    pub fn session_opened(session_id: &str, principal: &str, pid: Option<u32>) {
        let details = match pid {
            Some(pid) => format!("Terminal session opened (child pid {})", pid),
            None => "Console session opened".to_string(),
        };
        log_security_event(
            SecurityEvent::new(SecurityEventType::SessionOpened, details)
                .with_session_id(session_id)
                .with_principal(principal),
        );
    }

    pub fn session_closed(session_id: &str, principal: &str, reason: &str) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::SessionClosed,
                format!("Terminal session closed: {}", reason),
            )
            .with_session_id(session_id)
            .with_principal(principal),
        );
    }

    pub fn session_failed(principal: &str, error: &str) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::SessionFailed,
                format!("Terminal session failed to start: {}", error),
            )
            .with_principal(principal),
        );
    }

    pub fn principal_created(principal: &str, home: &str) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::PrincipalCreated,
                format!("Principal materialized with home {}", home),
            )
            .with_principal(principal)
            .with_file_path(home),
        );
    }

    pub fn principal_destroyed(principal: &str) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::PrincipalDestroyed,
                "Principal destroyed (processes killed, home removed)".to_string(),
            )
            .with_principal(principal),
        );
    }

    /// A principal is running without dedicated OS-level isolation
    pub fn principal_degraded(principal: &str, reason: &str) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::PrincipalDegraded,
                format!("Isolation degraded: {}", reason),
            )
            .with_principal(principal),
        );
    }

    pub fn lease_checkout(subnet: String, exclusive: bool) {
        log_security_event(SecurityEvent::new(
            SecurityEventType::LeaseCheckout,
            format!(
                "Network lease {} checked out ({})",
                subnet,
                if exclusive { "exclusive" } else { "shared" }
            ),
        ));
    }

    pub fn lease_released(holder: &str, count: usize) {
        log_security_event(SecurityEvent::new(
            SecurityEventType::LeaseReleased,
            format!("{} network lease(s) held by {} released", count, holder),
        ));
    }

    /// A student lab folder was stopped, and removed when `removed` is set
    pub fn lab_stopped(folder: &str, principal: &str, removed: bool) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::LabStopped,
                format!(
                    "Lab folder {} {}",
                    folder,
                    if removed { "stopped and removed" } else { "stopped" }
                ),
            )
            .with_principal(principal),
        );
    }

    pub fn provisioning_warning(lab: &str, principal: &str, warning: &str) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::ProvisioningWarning,
                format!("Lab '{}': {}", lab, warning),
            )
            .with_principal(principal),
        );
    }

    pub fn lab_started(lab: &str, principal: &str, folder: &str, warnings: usize) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::LabStarted,
                format!("Lab '{}' started with {} warning(s)", lab, warnings),
            )
            .with_principal(principal)
            .with_file_path(folder),
        );
    }

    pub fn submission_graded(lab: &str, email: &str, score: u32, passed: bool) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::SubmissionGraded,
                format!(
                    "Lab '{}' graded: score={} passed={}",
                    lab, score, passed
                ),
            )
            .with_principal(email),
        );
    }

    pub fn submission_rejected(lab: &str, email: &str, reason: &str) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::SubmissionRejected,
                format!("Lab '{}' submission rejected: {}", lab, reason),
            )
            .with_principal(email),
        );
    }

    pub fn configuration_violation(details: String) {
        log_security_event(SecurityEvent::new(
            SecurityEventType::ConfigurationViolation,
            details,
        ));
    }
}
