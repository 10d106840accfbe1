//! Degraded isolation: per-student home directories under the service account.
//!
//! Students are separated only by directory. Every principal reports
//! `isolated = false` and materialization is audited as degraded. Intended for
//! development hosts where account management is unavailable.

use super::{IsolationStrategy, Principal};
use crate::config::types::{IsolationKind, LabError, PrincipalConfig, Result};
use std::path::PathBuf;

pub struct SharedAccountStrategy {
    config: PrincipalConfig,
}

impl SharedAccountStrategy {
    pub fn new(config: PrincipalConfig) -> Self {
        Self { config }
    }

    fn home_of(&self, name: &str) -> PathBuf {
        self.config.home_root.join(name)
    }

    fn principal(&self, name: &str) -> Principal {
        Principal::service_fallback(name, self.home_of(name), self.config.login_shell.clone())
    }
}

impl IsolationStrategy for SharedAccountStrategy {
    fn kind(&self) -> IsolationKind {
        IsolationKind::SharedAccount
    }

    fn lookup(&self, name: &str) -> Result<Option<Principal>> {
        Ok(self
            .home_of(name)
            .is_dir()
            .then(|| self.principal(name)))
    }

    fn create(&self, name: &str) -> Result<Principal> {
        let home = self.home_of(name);
        std::fs::create_dir_all(&home).map_err(|e| {
            LabError::Principal(format!("Failed to create home {}: {}", home.display(), e))
        })?;
        Ok(self.principal(name))
    }

    fn destroy(&self, name: &str) -> Result<()> {
        let home = self.home_of(name);
        if home.exists() {
            std::fs::remove_dir_all(&home)?;
        }
        Ok(())
    }
}
