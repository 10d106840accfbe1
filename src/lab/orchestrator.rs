//! Wrapper around the external lab orchestration tooling.
//!
//! Commands are opaque: labbox only bounds their run time and reports the
//! exit code and raw text.

use crate::config::types::{LabError, ProvisioningConfig, Result};
use crate::utils::output::OutputLimits;
use crate::utils::process::{run_bounded, RunOutcome};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

const REBUILD_TIMEOUT: Duration = Duration::from_secs(300);
const START_TIMEOUT: Duration = Duration::from_secs(120);
const STOP_TIMEOUT: Duration = Duration::from_secs(60);
const STATUS_TIMEOUT: Duration = Duration::from_secs(30);
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorAction {
    Rebuild,
    Start,
    Stop,
    Status,
    Exec,
}

impl OrchestratorAction {
    pub fn timeout(self) -> Duration {
        match self {
            OrchestratorAction::Rebuild => REBUILD_TIMEOUT,
            OrchestratorAction::Start => START_TIMEOUT,
            OrchestratorAction::Stop => STOP_TIMEOUT,
            OrchestratorAction::Status => STATUS_TIMEOUT,
            OrchestratorAction::Exec => EXEC_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrchestratorOutcome {
    pub action: OrchestratorAction,
    pub exit_code: i32,
    pub output: String,
    pub timed_out: bool,
}

impl OrchestratorOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabStatus {
    pub running: bool,
    pub output: Option<String>,
}

pub struct Orchestrator {
    dir: PathBuf,
    program: String,
    rebuild_program: String,
}

impl Orchestrator {
    pub fn new(dir: PathBuf, program: impl Into<String>, rebuild_program: impl Into<String>) -> Self {
        Self {
            dir,
            program: program.into(),
            rebuild_program: rebuild_program.into(),
        }
    }

    pub fn from_config(config: &ProvisioningConfig) -> Self {
        Self::new(
            config.orchestrator_dir.clone(),
            config.orchestrator_program.clone(),
            config.rebuild_program.clone(),
        )
    }

    pub fn rebuild(&self, folder: &str) -> Result<OrchestratorOutcome> {
        let mut cmd = Command::new(&self.rebuild_program);
        cmd.arg(folder);
        self.invoke(OrchestratorAction::Rebuild, cmd)
    }

    pub fn start(&self, folder: &str) -> Result<OrchestratorOutcome> {
        self.lifecycle(OrchestratorAction::Start, "start", folder)
    }

    pub fn stop(&self, folder: &str) -> Result<OrchestratorOutcome> {
        self.lifecycle(OrchestratorAction::Stop, "stop", folder)
    }

    /// Running when the tool succeeds and its output mentions "running"
    pub fn status(&self, folder: &str) -> Result<LabStatus> {
        let outcome = self.lifecycle(OrchestratorAction::Status, "status", folder)?;
        if !outcome.success() {
            return Ok(LabStatus {
                running: false,
                output: None,
            });
        }
        Ok(LabStatus {
            running: outcome.output.to_lowercase().contains("running"),
            output: Some(outcome.output),
        })
    }

    /// `<tool> exec <folder> -- <command>`
    pub fn exec(&self, folder: &str, command: &str) -> Result<OrchestratorOutcome> {
        let mut cmd = Command::new(&self.program);
        cmd.args(["exec", folder, "--", command]);
        self.invoke(OrchestratorAction::Exec, cmd)
    }

    fn lifecycle(
        &self,
        action: OrchestratorAction,
        verb: &str,
        folder: &str,
    ) -> Result<OrchestratorOutcome> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(verb).arg(folder);
        self.invoke(action, cmd)
    }

    fn invoke(&self, action: OrchestratorAction, mut cmd: Command) -> Result<OrchestratorOutcome> {
        if !self.dir.is_dir() {
            return Err(LabError::Config(format!(
                "orchestrator directory {} does not exist",
                self.dir.display()
            )));
        }
        cmd.current_dir(&self.dir);
        log::debug!("Orchestrator {:?}: {:?}", action, cmd);

        let outcome = run_bounded(cmd, action.timeout(), OutputLimits::default())?;
        let result = match &outcome {
            RunOutcome::Exited { code, output, .. } => OrchestratorOutcome {
                action,
                exit_code: *code,
                output: output.stdout_text(),
                timed_out: false,
            },
            RunOutcome::TimedOut { output, .. } => OrchestratorOutcome {
                action,
                exit_code: outcome.exit_code(),
                output: output.stdout_text(),
                timed_out: true,
            },
        };
        if result.timed_out {
            log::warn!("Orchestrator {:?} timed out after {:?}", action, action.timeout());
        }
        Ok(result)
    }
}
