//! OS principals.
//!
//! Every student gets one isolated identity with its own home directory. The
//! name is derived deterministically from the student's email, so repeated
//! lab starts land on the same account. How the identity is materialized is
//! delegated to an [`IsolationStrategy`].

pub mod os_user;
pub mod shared;
pub mod validation;

pub use validation::IdPolicy;
use crate::config::types::{IsolationKind, LabError, PrincipalConfig, Result};
use crate::observability::audit::events;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;

/// Upper bound enforced by useradd on most distributions
pub const MAX_PRINCIPAL_NAME: usize = 32;
const NAME_PREFIX: &str = "stu_";
const HASH_CHARS: usize = 8;

/// Caller-supplied student identity. Never authenticated here.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub email: String,
}

impl Identity {
    pub fn new(email: impl Into<String>) -> Result<Self> {
        let email = email.into().trim().to_string();
        let valid = email
            .split_once('@')
            .map(|(local, domain)| !local.is_empty() && !domain.is_empty())
            .unwrap_or(false);
        if !valid {
            return Err(LabError::Principal(format!("'{}' is not an email address", email)));
        }
        Ok(Self { email })
    }

    pub fn principal_name(&self) -> String {
        principal_name(&self.email)
    }
}

/// Deterministic OS account name for an email.
///
/// `stu_<sanitized local part>_<8 hex of sha256(email)>`, lower-case, at most
/// 32 characters. The hash keeps distinct emails with the same local part apart.
pub fn principal_name(email: &str) -> String {
    let normalized = email.trim().to_lowercase();
    let local = normalized.split('@').next().unwrap_or_default();

    let mut sanitized: String = local
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let budget = MAX_PRINCIPAL_NAME - NAME_PREFIX.len() - 1 - HASH_CHARS;
    sanitized.truncate(budget);
    if sanitized.is_empty() {
        sanitized.push_str("user");
    }

    let digest = hex::encode(Sha256::digest(normalized.as_bytes()));
    format!("{}{}_{}", NAME_PREFIX, sanitized, &digest[..HASH_CHARS])
}

/// One materialized student identity
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: PathBuf,
    /// False when the principal shares the service account's uid
    pub isolated: bool,
}

impl Principal {
    /// Stand-in used when materialization fails: the service account's ids
    /// under the student's derived name.
    pub fn service_fallback(name: &str, home: PathBuf, shell: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            uid: nix::unistd::geteuid().as_raw(),
            gid: nix::unistd::getegid().as_raw(),
            home,
            shell,
            isolated: false,
        }
    }

    /// Set the child's uid/gid to this principal's when they differ from ours
    pub fn bind_command(&self, cmd: &mut Command) {
        if self.gid != nix::unistd::getegid().as_raw() {
            cmd.gid(self.gid);
        }
        if self.uid != nix::unistd::geteuid().as_raw() {
            cmd.uid(self.uid);
        }
    }
}

/// How principals are materialized on the host
pub trait IsolationStrategy: Send + Sync {
    fn kind(&self) -> IsolationKind;

    /// Existing principal with this name, if any
    fn lookup(&self, name: &str) -> Result<Option<Principal>>;

    /// Create the identity and its home directory
    fn create(&self, name: &str) -> Result<Principal>;

    /// Kill the principal's processes, then remove the identity and its home
    fn destroy(&self, name: &str) -> Result<()>;
}

/// Build the strategy configured in `config`
pub fn strategy_from_config(config: &PrincipalConfig) -> Box<dyn IsolationStrategy> {
    match config.isolation {
        IsolationKind::OsUser => Box::new(os_user::OsUserStrategy::new(config.clone())),
        IsolationKind::SharedAccount => Box::new(shared::SharedAccountStrategy::new(config.clone())),
    }
}

/// Registry of principals known to this process
pub struct PrincipalManager {
    strategy: Box<dyn IsolationStrategy>,
    registry: Mutex<HashMap<String, Principal>>,
    policy: IdPolicy,
}

impl PrincipalManager {
    pub fn new(strategy: Box<dyn IsolationStrategy>, policy: IdPolicy) -> Self {
        Self {
            strategy,
            registry: Mutex::new(HashMap::new()),
            policy,
        }
    }

    pub fn from_config(config: &PrincipalConfig) -> Self {
        Self::new(strategy_from_config(config), IdPolicy::from_config(config))
    }

    pub fn isolation(&self) -> IsolationKind {
        self.strategy.kind()
    }

    /// Return the principal for `identity`, creating it on first use.
    ///
    /// Creation runs under the registry lock so two lab starts for the same
    /// student never race on account creation.
    pub fn ensure(&self, identity: &Identity) -> Result<Principal> {
        let name = identity.principal_name();
        let mut registry = self
            .registry
            .lock()
            .map_err(|_| LabError::Principal("principal registry lock poisoned".to_string()))?;

        if let Some(existing) = registry.get(&name) {
            return Ok(existing.clone());
        }

        let principal = match self.strategy.lookup(&name)? {
            Some(found) => {
                log::debug!("Principal {} already exists (uid {})", found.name, found.uid);
                found
            }
            None => {
                let created = self.strategy.create(&name)?;
                events::principal_created(&created.name, &created.home.to_string_lossy());
                created
            }
        };

        validation::validate_principal(&principal, &self.policy)?;
        if !principal.isolated {
            events::principal_degraded(&principal.name, "shares the service account uid");
        }

        registry.insert(name, principal.clone());
        Ok(principal)
    }

    /// Cascade delete: processes, identity, home. Explicit admin action only.
    ///
    /// Refuses names that are not student principals and accounts holding
    /// root, the service uid or a system uid.
    pub fn destroy(&self, name: &str) -> Result<()> {
        validation::validate_name(name)?;
        let mut registry = self
            .registry
            .lock()
            .map_err(|_| LabError::Principal("principal registry lock poisoned".to_string()))?;

        let known = match registry.get(name) {
            Some(principal) => Some(principal.clone()),
            None => self.strategy.lookup(name)?,
        };
        if let Some(principal) = &known {
            validation::validate_removal(principal, &self.policy)?;
        }

        self.strategy.destroy(name)?;
        registry.remove(name);
        events::principal_destroyed(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Principal> {
        self.registry
            .lock()
            .ok()
            .and_then(|registry| registry.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingStrategy {
        creates: Arc<AtomicUsize>,
        uid: u32,
        /// `lookup` finds an account with `uid` instead of nothing
        existing: bool,
        destroys: Arc<AtomicUsize>,
    }

    impl CountingStrategy {
        fn new(uid: u32) -> Self {
            Self {
                creates: Arc::new(AtomicUsize::new(0)),
                uid,
                existing: false,
                destroys: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn account(&self, name: &str) -> Principal {
            Principal {
                name: name.to_string(),
                uid: self.uid,
                gid: self.uid,
                home: PathBuf::from("/home").join(name),
                shell: PathBuf::from("/bin/bash"),
                isolated: true,
            }
        }
    }

    fn policy() -> IdPolicy {
        IdPolicy {
            strict_mode: true,
            min_uid: 1000,
            service_uid: 999,
        }
    }

    impl IsolationStrategy for CountingStrategy {
        fn kind(&self) -> IsolationKind {
            IsolationKind::OsUser
        }

        fn lookup(&self, name: &str) -> Result<Option<Principal>> {
            Ok(self.existing.then(|| self.account(name)))
        }

        fn create(&self, name: &str) -> Result<Principal> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(self.account(name))
        }

        fn destroy(&self, _name: &str) -> Result<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn names_are_deterministic_and_bounded() {
        let a = principal_name("Alice.Smith@Example.com");
        let b = principal_name("  alice.smith@example.com ");
        assert_eq!(a, b);
        assert!(a.starts_with("stu_alice_smith_"));
        assert!(a.len() <= MAX_PRINCIPAL_NAME);

        let long = principal_name("a.very.long.local.part.that.keeps.going@example.com");
        assert_eq!(long.len(), MAX_PRINCIPAL_NAME);
    }

    #[test]
    fn same_local_part_different_domain_differ() {
        assert_ne!(
            principal_name("bob@one.example"),
            principal_name("bob@two.example")
        );
    }

    #[test]
    fn identity_requires_email_shape() {
        assert!(Identity::new("bob@example.com").is_ok());
        assert!(Identity::new("bob").is_err());
        assert!(Identity::new("@example.com").is_err());
    }

    #[test]
    fn ensure_creates_once_and_caches() {
        let strategy = CountingStrategy::new(2000);
        let creates = strategy.creates.clone();
        let manager = PrincipalManager::new(Box::new(strategy), policy());
        let identity = Identity::new("carol@example.com").unwrap();
        let first = manager.ensure(&identity).unwrap();
        let second = manager.ensure(&identity).unwrap();
        assert_eq!(first, second);
        assert_eq!(creates.load(Ordering::SeqCst), 1);
        assert!(manager.get(&first.name).is_some());

        manager.destroy(&first.name).unwrap();
        assert!(manager.get(&first.name).is_none());
    }

    #[test]
    fn strict_mode_rejects_root_principal() {
        let manager = PrincipalManager::new(Box::new(CountingStrategy::new(0)), policy());
        let err = manager
            .ensure(&Identity::new("root@example.com").unwrap())
            .unwrap_err();
        assert!(matches!(err, LabError::Privilege(_)));
    }

    #[test]
    fn destroy_refuses_non_student_names() {
        let strategy = CountingStrategy::new(2000);
        let destroys = strategy.destroys.clone();
        let manager = PrincipalManager::new(Box::new(strategy), policy());
        for name in ["root", "daemon", "stu_../../etc_0123abcd", ""] {
            assert!(matches!(manager.destroy(name), Err(LabError::Principal(_))));
        }
        assert_eq!(destroys.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn destroy_refuses_system_and_service_accounts() {
        let name = principal_name("eve@example.com");
        for uid in [0, 42, 999] {
            let strategy = CountingStrategy {
                existing: true,
                ..CountingStrategy::new(uid)
            };
            let destroys = strategy.destroys.clone();
            let manager = PrincipalManager::new(Box::new(strategy), policy());
            assert!(matches!(manager.destroy(&name), Err(LabError::Privilege(_))));
            assert_eq!(destroys.load(Ordering::SeqCst), 0);
        }

        let strategy = CountingStrategy {
            existing: true,
            ..CountingStrategy::new(1500)
        };
        let destroys = strategy.destroys.clone();
        let manager = PrincipalManager::new(Box::new(strategy), policy());
        manager.destroy(&name).unwrap();
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
    }
}
