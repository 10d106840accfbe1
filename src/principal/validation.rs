//! Guards on which accounts labbox may run students as, or delete.
//!
//! Student principals are always `stu_<local>_<hash>` names with uids in the
//! regular user range. Anything else (root, system accounts, the service
//! account itself) is refused before a command runs as it or an account
//! removal touches it.

use super::Principal;
use crate::config::types::{LabError, PrincipalConfig, Result};
use regex::Regex;
use std::sync::OnceLock;

fn principal_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^stu_[a-z0-9_]{1,19}_[0-9a-f]{8}$").expect("principal name regex is valid")
    })
}

/// Which uids a student principal may hold
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdPolicy {
    /// Refuse root principals outright instead of warning
    pub strict_mode: bool,
    /// Lowest uid an isolated principal may have
    pub min_uid: u32,
    /// Effective uid of this process
    pub service_uid: u32,
}

impl IdPolicy {
    pub fn from_config(config: &PrincipalConfig) -> Self {
        Self {
            strict_mode: config.strict_mode,
            min_uid: config.min_uid,
            service_uid: nix::unistd::geteuid().as_raw(),
        }
    }
}

/// Only names [`super::principal_name`] can produce are accepted
pub fn validate_name(name: &str) -> Result<()> {
    if principal_name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(LabError::Principal(format!(
            "'{}' is not a student principal name",
            name
        )))
    }
}

/// Check a principal before anything runs as it.
///
/// Root is refused in strict mode and logged otherwise. An isolated principal
/// must not share the service uid, and in strict mode must sit at or above
/// `min_uid`.
pub fn validate_principal(principal: &Principal, policy: &IdPolicy) -> Result<()> {
    if principal.uid == 0 || principal.gid == 0 {
        let msg = format!(
            "principal {} resolves to root (uid={}, gid={})",
            principal.name, principal.uid, principal.gid
        );
        if policy.strict_mode {
            return Err(LabError::Privilege(msg));
        }
        log::warn!("{} (permissive mode)", msg);
    }

    if !principal.isolated {
        return Ok(());
    }
    if principal.uid == policy.service_uid {
        return Err(LabError::Privilege(format!(
            "isolated principal {} has the service uid {}",
            principal.name, principal.uid
        )));
    }
    if principal.uid < policy.min_uid {
        let msg = format!(
            "principal {} has system uid {} (below {})",
            principal.name, principal.uid, policy.min_uid
        );
        if policy.strict_mode {
            return Err(LabError::Privilege(msg));
        }
        log::warn!("{} (permissive mode)", msg);
    }
    Ok(())
}

/// Check an account before it is deleted. Strict regardless of mode.
pub fn validate_removal(principal: &Principal, policy: &IdPolicy) -> Result<()> {
    validate_name(&principal.name)?;
    if !principal.isolated {
        return Ok(());
    }
    if principal.uid == 0 || principal.uid == policy.service_uid || principal.uid < policy.min_uid {
        return Err(LabError::Privilege(format!(
            "refusing to remove account {} (uid {})",
            principal.name, principal.uid
        )));
    }
    Ok(())
}
