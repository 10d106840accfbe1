//! Parameter substitution.
//!
//! Each lab parameter owns a list of candidate values. Resolution draws one
//! candidate per parameter, fills in the principal placeholder and, when
//! network placeholders remain, exactly one lease shared by every network
//! token inside that value. Application rewrites template files inside the
//! student folder; command substitution rewrites run-commands.

use crate::config::types::{LabError, ParameterMode, Result};
use crate::lab::definition::LabDefinition;
use crate::lab::lease::{LeasePool, NetworkLease};
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, OnceLock};

pub const STUDENT_TOKEN: &str = "${STUDENT}";
pub const NETMASK_TOKEN: &str = "${NETMASK}";
pub const GATEWAY_TOKEN: &str = "${GATEWAY}";
const SUBNET_PREFIX_MARKER: &str = "${SUBNET_PREFIX_";

fn subnet_prefix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{SUBNET_PREFIX_(\d+)\}").expect("subnet prefix regex is valid")
    })
}

/// Resolved token values in declaration order
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenMap {
    entries: Vec<(String, String)>,
}

impl TokenMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a token's value, keeping first-insertion order
    pub fn insert(&mut self, token: impl Into<String>, value: impl Into<String>) {
        let token = token.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(t, _)| *t == token) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((token, value)),
        }
    }

    pub fn get(&self, token: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(t, _)| t == token)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(t, v)| (t.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Literal substring replacement of every token, then the principal placeholder
    pub fn substitute(&self, text: &str, principal: &str) -> String {
        let mut out = text.to_string();
        for (token, value) in self.iter() {
            out = out.replace(token, value);
        }
        out.replace(STUDENT_TOKEN, principal)
    }
}

/// Key a lab instance holds leases under; also the student folder name
pub fn lease_holder(principal: &str, lab: &LabDefinition) -> String {
    format!("{}-{}", principal, lab.template)
}

fn has_network_placeholder(value: &str) -> bool {
    value.contains(NETMASK_TOKEN)
        || value.contains(GATEWAY_TOKEN)
        || value.contains(SUBNET_PREFIX_MARKER)
}

/// Replace every network placeholder in `value` from one lease
fn fill_network(value: &str, lease: &NetworkLease) -> Result<String> {
    let mut out = value
        .replace(NETMASK_TOKEN, &lease.mask.to_string())
        .replace(GATEWAY_TOKEN, &lease.gateway.to_string());

    let mut failure = None;
    out = subnet_prefix_pattern()
        .replace_all(&out, |caps: &regex::Captures| {
            let index = caps[1].parse::<u32>().ok();
            match index.map(|i| lease.offset(i)) {
                Some(Ok(addr)) => addr.to_string(),
                Some(Err(e)) => {
                    failure = Some(e);
                    String::new()
                }
                None => {
                    failure = Some(LabError::Config(format!(
                        "subnet prefix index '{}' is out of range",
                        &caps[1]
                    )));
                    String::new()
                }
            }
        })
        .into_owned();

    match failure {
        Some(e) => Err(e),
        None => Ok(out),
    }
}

/// Resolves and applies lab parameters
pub struct SubstitutionEngine {
    pool: Arc<LeasePool>,
    mode: ParameterMode,
}

impl SubstitutionEngine {
    pub fn new(pool: Arc<LeasePool>, mode: ParameterMode) -> Self {
        Self { pool, mode }
    }

    pub fn mode(&self) -> ParameterMode {
        self.mode
    }

    /// Draw one candidate per parameter and resolve its placeholders.
    ///
    /// No filesystem access. Leases are checked out under
    /// [`lease_holder`], so repeated resolution for the same lab instance
    /// reuses an exclusive lease. Fails with `ResourceExhausted` when a value
    /// needs a lease and the pool has none.
    pub fn resolve<R: Rng + ?Sized>(
        &self,
        lab: &LabDefinition,
        principal: &str,
        rng: &mut R,
    ) -> Result<TokenMap> {
        let holder = lease_holder(principal, lab);
        let mut tokens = TokenMap::new();
        for param in &lab.parameters {
            let candidate = param.values.choose(rng).ok_or_else(|| {
                LabError::Config(format!("parameter {} has no candidate values", param.token))
            })?;

            let mut value = candidate.replace(STUDENT_TOKEN, principal);
            if has_network_placeholder(&value) {
                let lease = self.pool.checkout(&holder)?;
                value = fill_network(&value, &lease)?;
            }
            log::debug!("Resolved {} for {}", param.token, principal);
            tokens.insert(param.token.clone(), value);
        }
        Ok(tokens)
    }

    /// Rewrite every file-bound parameter inside `student_folder`.
    ///
    /// Returns warnings for template files that are missing; those are not fatal.
    pub fn apply(
        &self,
        lab: &LabDefinition,
        tokens: &TokenMap,
        principal: &str,
        student_folder: &Path,
    ) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        for param in &lab.parameters {
            let Some(file) = &param.file else {
                continue;
            };

            let resolved_rel = file.replace(STUDENT_TOKEN, principal);
            let target = student_folder.join(&resolved_rel);

            if file.contains(STUDENT_TOKEN) {
                let source = student_folder.join(file);
                if source.exists() {
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::rename(&source, &target)?;
                    log::debug!("Renamed {} -> {}", source.display(), target.display());
                } else if !target.exists() {
                    warnings.push(format!("template file {} not found", file));
                    continue;
                }
            }

            if !target.is_file() {
                warnings.push(format!("template file {} not found", resolved_rel));
                continue;
            }

            let text = std::fs::read_to_string(&target)?;
            let rewritten = tokens.substitute(&text, principal);
            if rewritten != text {
                std::fs::write(&target, rewritten)?;
            }
        }

        Ok(warnings)
    }

    /// Substitute a run-command.
    ///
    /// Pinned mode reuses `pinned`; independent mode draws fresh values for
    /// this command alone.
    pub fn substitute_command<R: Rng + ?Sized>(
        &self,
        command: &str,
        lab: &LabDefinition,
        pinned: &TokenMap,
        principal: &str,
        rng: &mut R,
    ) -> Result<String> {
        match self.mode {
            ParameterMode::Pinned => Ok(pinned.substitute(command, principal)),
            ParameterMode::Independent => {
                let fresh = self.resolve(lab, principal, rng)?;
                Ok(fresh.substitute(command, principal))
            }
        }
    }
}
