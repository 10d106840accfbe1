//! Command admission.
//!
//! Free-form commands typed into the fallback console are validated against
//! an allow-list, a fixed set of dangerous patterns and the lab's
//! accessible-resource scope before they run as the student's principal.
//! Every decision produces a [`CommandLogEntry`] and an audit event.

pub mod exec;
pub mod gate;
pub mod paths;

use crate::config::types::{AdmissionConfig, LabError, Result};
use crate::principal::Principal;
use crate::utils::env_hygiene::EnvPolicy;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Outcome of validation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: String,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: "Command allowed".to_string(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }

    pub fn into_result(self) -> Result<()> {
        if self.allowed {
            Ok(())
        } else {
            Err(LabError::AdmissionDenied(self.reason))
        }
    }
}

/// Append-only record of one console command
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandLogEntry {
    pub command: String,
    pub allowed: bool,
    pub blocked_reason: Option<String>,
    pub output: String,
    pub exit_code: i32,
    pub timestamp: DateTime<Utc>,
}

/// What the console should do with the result of a command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Text to show, possibly empty
    Output(String),
    /// Working directory changed
    ChangeDir(PathBuf),
    /// Client should clear its screen
    Clear,
    /// Admission refused the command
    Blocked(String),
}

#[derive(Clone, Debug)]
pub struct Execution {
    pub effect: Effect,
    pub log: CommandLogEntry,
    /// The command was killed at the admission timeout
    pub timed_out: bool,
}

impl Execution {
    /// The log entry of a command that was admitted and ran to completion.
    ///
    /// Refusal maps to [`LabError::AdmissionDenied`] and a timeout to
    /// [`LabError::ExecutionTimeout`], so callers can surface their exit codes.
    pub fn into_result(self, timeout: Duration) -> Result<CommandLogEntry> {
        if let Effect::Blocked(reason) = self.effect {
            return Err(LabError::AdmissionDenied(reason));
        }
        if self.timed_out {
            return Err(LabError::ExecutionTimeout(timeout));
        }
        Ok(self.log)
    }
}

/// Who is running a command, and where
pub struct CommandContext<'a> {
    pub session_id: &'a str,
    pub principal: &'a Principal,
    pub current_dir: &'a Path,
    pub accessible_resources: &'a [String],
}

/// Validates and executes console commands
pub struct AdmissionController {
    config: AdmissionConfig,
    env_policy: EnvPolicy,
    dangerous: Vec<(&'static str, Regex)>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, env_policy: EnvPolicy) -> Self {
        Self {
            config,
            env_policy,
            dangerous: gate::dangerous_patterns(),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }
}
