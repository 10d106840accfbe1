//! Lab lifecycle.
//!
//! Start clones the lab template into a per-student folder, materializes the
//! student's principal, resolves and applies parameters, hands the folder to
//! the principal, runs the lab's setup commands as that principal and finally
//! the build step. Only a missing template or an exhausted lease pool aborts;
//! every other failure is recorded as a warning on the report. Stop and
//! principal retirement give the instance's leases back.

use super::definition::LabDefinition;
use super::lease::{LeasePool, NetworkLease};
use super::orchestrator::{Orchestrator, OrchestratorOutcome};
use super::params::{lease_holder, SubstitutionEngine, TokenMap};
use crate::config::types::{LabError, LabboxConfig, ProvisioningConfig, Result};
use crate::observability::audit::events;
use crate::principal::{validation, Identity, Principal, PrincipalManager};
use crate::utils::env_hygiene::{EnvPolicy, IsolatedEnv};
use crate::utils::output::OutputLimits;
use crate::utils::process::run_bounded;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

/// Result of one setup or build command
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: String,
    pub exit_code: i32,
    pub output: String,
    pub timed_out: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LabStartReport {
    pub lab: String,
    pub principal: Principal,
    pub student_folder: PathBuf,
    pub tokens: TokenMap,
    /// Leases this instance holds (exclusive pools only)
    pub leases: Vec<NetworkLease>,
    pub commands: Vec<CommandOutcome>,
    pub build: Option<CommandOutcome>,
    pub warnings: Vec<String>,
}

impl LabStartReport {
    fn warn(&mut self, warning: String) {
        log::warn!("{}: {}", self.lab, warning);
        events::provisioning_warning(&self.lab, &self.principal.name, &warning);
        self.warnings.push(warning);
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LabStopReport {
    pub lab: String,
    pub student_folder: PathBuf,
    pub stop: Option<OrchestratorOutcome>,
    pub leases_released: usize,
    pub warnings: Vec<String>,
}

/// What removing a student took with it
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetireReport {
    pub principal: String,
    pub removed_folders: Vec<PathBuf>,
    pub leases_released: usize,
    pub warnings: Vec<String>,
}

fn note(warnings: &mut Vec<String>, warning: String) {
    log::warn!("{}", warning);
    warnings.push(warning);
}

pub struct LabProvisioner {
    config: ProvisioningConfig,
    principals: Arc<PrincipalManager>,
    pool: Arc<LeasePool>,
    engine: SubstitutionEngine,
    orchestrator: Orchestrator,
    env_policy: EnvPolicy,
}

impl LabProvisioner {
    pub fn new(
        config: ProvisioningConfig,
        principals: Arc<PrincipalManager>,
        pool: Arc<LeasePool>,
        env_policy: EnvPolicy,
    ) -> Self {
        let engine = SubstitutionEngine::new(pool.clone(), config.parameter_mode);
        let orchestrator = Orchestrator::from_config(&config);
        Self {
            config,
            principals,
            pool,
            engine,
            orchestrator,
            env_policy,
        }
    }

    pub fn from_config(config: &LabboxConfig, principals: Arc<PrincipalManager>) -> Result<Self> {
        let pool = LeasePool::from_specs(
            &config.provisioning.leases,
            config.provisioning.exclusive_leases,
        )?;
        Ok(Self::new(
            config.provisioning.clone(),
            principals,
            Arc::new(pool),
            EnvPolicy::from_terminal(&config.terminal),
        ))
    }

    pub fn pool(&self) -> &LeasePool {
        &self.pool
    }

    /// `<student_labs_root>/<principal>-<template>`
    pub fn student_folder(&self, principal_name: &str, lab: &LabDefinition) -> PathBuf {
        self.config
            .student_labs_root
            .join(lease_holder(principal_name, lab))
    }

    pub fn start(&self, lab: &LabDefinition, identity: &Identity) -> Result<LabStartReport> {
        self.start_with_rng(lab, identity, &mut rand::thread_rng())
    }

    pub fn start_with_rng<R: Rng + ?Sized>(
        &self,
        lab: &LabDefinition,
        identity: &Identity,
        rng: &mut R,
    ) -> Result<LabStartReport> {
        let template_dir = self.config.templates_root.join(&lab.template);
        if !template_dir.is_dir() {
            return Err(LabError::ProvisioningFailure(format!(
                "template {} not found under {}",
                lab.template,
                self.config.templates_root.display()
            )));
        }

        let name = identity.principal_name();
        let student_folder = self.student_folder(&name, lab);
        let placeholder = Principal::service_fallback(
            &name,
            student_folder.clone(),
            PathBuf::from("/bin/sh"),
        );
        let mut report = LabStartReport {
            lab: lab.name.clone(),
            principal: placeholder,
            student_folder: student_folder.clone(),
            tokens: TokenMap::new(),
            leases: Vec::new(),
            commands: Vec::new(),
            build: None,
            warnings: Vec::new(),
        };

        if !student_folder.exists() {
            if let Err(e) = copy_dir_recursive(&template_dir, &student_folder) {
                report.warn(format!("failed to clone template: {}", e));
            } else {
                log::info!("Cloned {} into {}", template_dir.display(), student_folder.display());
            }
        }

        match self.principals.ensure(identity) {
            Ok(principal) => report.principal = principal,
            Err(e) => report.warn(format!(
                "principal unavailable, running as service account: {}",
                e
            )),
        }

        let holder = lease_holder(&name, lab);
        if let Err(e) = self.configure(lab, &name, &mut report, rng) {
            let released = self.pool.release(&holder);
            log::warn!(
                "Lab {} for {} aborted, {} lease(s) returned: {}",
                lab.name,
                name,
                released,
                e
            );
            return Err(e);
        }
        report.leases = self.pool.held_by(&holder);

        events::lab_started(
            &lab.name,
            &report.principal.name,
            &student_folder.to_string_lossy(),
            report.warnings.len(),
        );
        Ok(report)
    }

    /// Everything after the principal exists; leases are held from here on
    fn configure<R: Rng + ?Sized>(
        &self,
        lab: &LabDefinition,
        name: &str,
        report: &mut LabStartReport,
        rng: &mut R,
    ) -> Result<()> {
        let folder = report.student_folder.clone();
        let tokens = self.engine.resolve(lab, name, rng)?;
        match self.engine.apply(lab, &tokens, name, &folder) {
            Ok(warnings) => {
                for warning in warnings {
                    report.warn(warning);
                }
            }
            Err(e) => report.warn(format!("parameter application failed: {}", e)),
        }
        report.tokens = tokens;

        if report.principal.isolated && folder.exists() {
            if let Err(e) = chown_recursive(&folder, report.principal.uid, report.principal.gid) {
                report.warn(format!("failed to hand folder to {}: {}", report.principal.name, e));
            }
        }

        for raw in &lab.run_commands {
            let command = self
                .engine
                .substitute_command(raw, lab, &report.tokens, name, rng)?;
            let timeout = self.config.run_command_timeout();
            match self.run_in_folder(&command, &report.principal, &folder, timeout) {
                Ok(outcome) => {
                    if outcome.timed_out {
                        report.warn(format!("run-command timed out: {}", command));
                    } else if outcome.exit_code != 0 {
                        report.warn(format!(
                            "run-command exited with {}: {}",
                            outcome.exit_code, command
                        ));
                    }
                    report.commands.push(outcome);
                }
                Err(e) => report.warn(format!("run-command failed to start: {}: {}", command, e)),
            }
        }

        if let Some(build) = &lab.build_command {
            let command = report.tokens.substitute(build, name);
            if !folder.is_dir() {
                report.warn(format!("student folder missing, build skipped: {}", command));
                return Ok(());
            }
            // the build belongs to the service account, not the student
            let service = Principal::service_fallback(name, folder.clone(), PathBuf::from("/bin/sh"));
            match self.run_in_folder(&command, &service, &folder, self.config.build_timeout()) {
                Ok(outcome) => {
                    if outcome.timed_out {
                        report.warn(format!("build command timed out: {}", command));
                    } else if outcome.exit_code != 0 {
                        report.warn(format!("build command failed ({})", outcome.exit_code));
                    }
                    report.build = Some(outcome);
                }
                Err(e) => report.warn(format!("build command failed: {}", e)),
            }
        }
        Ok(())
    }

    /// Stop a student's lab instance and return its leases to the pool.
    ///
    /// The folder stays on disk. A failing stop is reported on the result;
    /// the leases are released either way.
    pub fn stop(&self, lab: &LabDefinition, identity: &Identity) -> LabStopReport {
        let name = identity.principal_name();
        let folder = lease_holder(&name, lab);
        let mut report = LabStopReport {
            lab: lab.name.clone(),
            student_folder: self.student_folder(&name, lab),
            stop: None,
            leases_released: 0,
            warnings: Vec::new(),
        };

        match self.orchestrator.stop(&folder) {
            Ok(outcome) => {
                if !outcome.success() {
                    note(
                        &mut report.warnings,
                        format!("stopping {} exited with {}", folder, outcome.exit_code),
                    );
                }
                report.stop = Some(outcome);
            }
            Err(e) => note(&mut report.warnings, format!("stopping {} failed: {}", folder, e)),
        }

        report.leases_released = self.pool.release(&folder);
        events::lab_stopped(&folder, &name, false);
        report
    }

    /// Remove a student entirely: every lab folder of the principal (stopped
    /// first), the leases those labs hold, then the account itself.
    ///
    /// A failing stop or folder removal is a warning; account removal errors
    /// are returned.
    pub fn retire_principal(&self, name: &str) -> Result<RetireReport> {
        validation::validate_name(name)?;
        let prefix = format!("{}-", name);
        let mut report = RetireReport {
            principal: name.to_string(),
            removed_folders: Vec::new(),
            leases_released: 0,
            warnings: Vec::new(),
        };

        let root = &self.config.student_labs_root;
        if root.is_dir() {
            for entry in std::fs::read_dir(root)? {
                let entry = entry?;
                let folder = entry.file_name().to_string_lossy().into_owned();
                // symlinks are never followed
                if !folder.starts_with(&prefix) || !entry.file_type()?.is_dir() {
                    continue;
                }

                match self.orchestrator.stop(&folder) {
                    Ok(outcome) if !outcome.success() => note(
                        &mut report.warnings,
                        format!("stopping {} exited with {}", folder, outcome.exit_code),
                    ),
                    Ok(_) => {}
                    Err(e) => {
                        note(&mut report.warnings, format!("stopping {} failed: {}", folder, e))
                    }
                }

                let path = entry.path();
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => {
                        log::info!("Removed lab folder {}", path.display());
                        events::lab_stopped(&folder, name, true);
                        report.removed_folders.push(path);
                    }
                    Err(e) => note(
                        &mut report.warnings,
                        format!("removing {} failed: {}", path.display(), e),
                    ),
                }
            }
        }

        report.leases_released = self.pool.release_prefix(&prefix);
        self.principals.destroy(name)?;
        Ok(report)
    }

    fn run_in_folder(
        &self,
        command: &str,
        principal: &Principal,
        folder: &Path,
        timeout: Duration,
    ) -> Result<CommandOutcome> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command);
        if folder.is_dir() {
            cmd.current_dir(folder);
        }
        IsolatedEnv::for_principal(principal, &self.env_policy).apply(&mut cmd);
        principal.bind_command(&mut cmd);

        let outcome = run_bounded(cmd, timeout, OutputLimits::default())?;
        Ok(CommandOutcome {
            command: command.to_string(),
            exit_code: outcome.exit_code(),
            output: outcome.output().combined_text(),
            timed_out: outcome.timed_out(),
        })
    }
}

/// Copy `src` into `dst`, creating `dst`
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(&src_path)?;
            std::os::unix::fs::symlink(target, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// `chown -R` without following symlinks
fn chown_recursive(path: &Path, uid: u32, gid: u32) -> Result<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    if std::fs::symlink_metadata(path)?.is_dir() {
        for entry in std::fs::read_dir(path)? {
            chown_recursive(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}
