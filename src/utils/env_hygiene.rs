/// Environment hygiene for student processes.
/// Student shells and commands never inherit the service environment: it is
/// cleared and rebuilt from a fixed set of variables scoped to the principal.
use crate::config::types::TerminalConfig;
use crate::principal::Principal;
use std::collections::HashMap;
use std::process::Command;

/// Loader variables that must never reach a student process
const DANGEROUS_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "LD_BIND_NOW",
    "LD_DEBUG",
    "LD_PROFILE",
];

/// Environment sanitization policy
#[derive(Debug, Clone)]
pub struct EnvPolicy {
    /// PATH handed to the student
    pub path: String,
    pub term: String,
    pub lang: String,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        EnvPolicy {
            path: "/usr/local/bin:/usr/bin:/bin".to_string(),
            term: "xterm-256color".to_string(),
            lang: "C.UTF-8".to_string(),
        }
    }
}

impl EnvPolicy {
    pub fn from_terminal(config: &TerminalConfig) -> Self {
        EnvPolicy {
            path: config.secure_path.clone(),
            term: config.term.clone(),
            ..EnvPolicy::default()
        }
    }
}

/// The rebuilt environment of one principal
#[derive(Debug, Clone)]
pub struct IsolatedEnv {
    vars: Vec<(String, String)>,
}

impl IsolatedEnv {
    /// HOME/USER/LOGNAME/SHELL/TERM/PATH/LANG for `principal`
    pub fn for_principal(principal: &Principal, policy: &EnvPolicy) -> Self {
        let home = principal.home.to_string_lossy().into_owned();
        let shell = principal.shell.to_string_lossy().into_owned();
        let vars = vec![
            ("HOME".to_string(), home),
            ("USER".to_string(), principal.name.clone()),
            ("LOGNAME".to_string(), principal.name.clone()),
            ("SHELL".to_string(), shell),
            ("TERM".to_string(), policy.term.clone()),
            ("PATH".to_string(), policy.path.clone()),
            ("LANG".to_string(), policy.lang.clone()),
        ];
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    /// Clear the inherited environment of `cmd` and install this one
    pub fn apply(&self, cmd: &mut Command) {
        cmd.env_clear();
        for (key, value) in &self.vars {
            cmd.env(key, value);
        }
    }
}

/// Validate environment safety
pub fn validate_environment_safety(env_map: &HashMap<String, String>) -> Vec<String> {
    let mut warnings = Vec::new();

    for var in DANGEROUS_VARS {
        if env_map.contains_key(*var) {
            warnings.push(format!("Dangerous environment variable present: {}", var));
        }
    }

    if let Some(path) = env_map.get("PATH") {
        warnings.extend(validate_path_value(path));
    }

    warnings
}

/// PATH entries must be absolute and free of home/relative references
pub fn validate_path_value(path: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    if path.contains("..") || path.contains('~') {
        warnings.push("PATH contains relative or home directory references".to_string());
    }
    if path.split(':').any(|entry| !entry.starts_with('/')) {
        warnings.push("PATH contains a non-absolute entry".to_string());
    }
    warnings
}
