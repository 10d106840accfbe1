//! One dedicated OS account per student, managed with useradd/userdel.

use super::{IsolationStrategy, Principal};
use crate::config::types::{IsolationKind, LabError, PrincipalConfig, Result};
use crate::utils::output::OutputLimits;
use crate::utils::process::{run_bounded, RunOutcome};
use nix::unistd::User;
use std::process::Command;
use std::time::Duration;

/// userdel exit status for "user does not exist"
const USERDEL_NO_SUCH_USER: i32 = 6;
/// pkill exit status for "no process matched"
const PKILL_NO_MATCH: i32 = 1;

pub struct OsUserStrategy {
    config: PrincipalConfig,
}

impl OsUserStrategy {
    pub fn new(config: PrincipalConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<RunOutcome> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        let outcome = run_bounded(cmd, self.timeout(), OutputLimits::default())?;
        if outcome.timed_out() {
            return Err(LabError::Principal(format!(
                "{} timed out after {:?}",
                program,
                self.timeout()
            )));
        }
        Ok(outcome)
    }
}

fn from_user(user: User) -> Principal {
    Principal {
        name: user.name,
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
        home: user.dir,
        shell: user.shell,
        isolated: true,
    }
}

impl IsolationStrategy for OsUserStrategy {
    fn kind(&self) -> IsolationKind {
        IsolationKind::OsUser
    }

    fn lookup(&self, name: &str) -> Result<Option<Principal>> {
        let user = User::from_name(name)
            .map_err(|e| LabError::Principal(format!("passwd lookup for {} failed: {}", name, e)))?;
        Ok(user.map(from_user))
    }

    fn create(&self, name: &str) -> Result<Principal> {
        let home = self.config.home_root.join(name);
        let home_arg = home.to_string_lossy().into_owned();
        let shell_arg = self.config.login_shell.to_string_lossy().into_owned();

        log::info!("Creating OS account {} with home {}", name, home_arg);
        let outcome = self.run(
            "useradd",
            &[
                "--create-home",
                "--home-dir",
                &home_arg,
                "--shell",
                &shell_arg,
                "--user-group",
                name,
            ],
        )?;
        if !outcome.success() {
            return Err(LabError::Principal(format!(
                "useradd {} failed ({}): {}",
                name,
                outcome.exit_code(),
                outcome.output().stderr_text().trim()
            )));
        }

        self.lookup(name)?.ok_or_else(|| {
            LabError::Principal(format!("account {} missing right after useradd", name))
        })
    }

    fn destroy(&self, name: &str) -> Result<()> {
        let existing = self.lookup(name)?;

        let pkill = self.run("pkill", &["-KILL", "-u", name])?;
        if !pkill.success() && pkill.exit_code() != PKILL_NO_MATCH {
            log::warn!("pkill for {} exited with {}", name, pkill.exit_code());
        }

        let userdel = self.run("userdel", &["--remove", name])?;
        if !userdel.success() && userdel.exit_code() != USERDEL_NO_SUCH_USER {
            return Err(LabError::Principal(format!(
                "userdel {} failed ({}): {}",
                name,
                userdel.exit_code(),
                userdel.output().stderr_text().trim()
            )));
        }

        let home = existing
            .map(|principal| principal.home)
            .unwrap_or_else(|| self.config.home_root.join(name));
        if home.starts_with(&self.config.home_root) && home.exists() {
            std::fs::remove_dir_all(&home)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_root_and_misses_unknown() {
        let strategy = OsUserStrategy::new(PrincipalConfig::default());
        let root = strategy.lookup("root").unwrap().unwrap();
        assert_eq!(root.uid, 0);
        assert!(strategy
            .lookup("stu_nobody_deadbeef")
            .unwrap()
            .is_none());
    }
}
