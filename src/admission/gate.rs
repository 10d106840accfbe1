//! Command validation.

use super::paths;
use super::{AdmissionController, Verdict};
use regex::Regex;
use std::path::Path;

/// Case-insensitive patterns rejected anywhere in the command text
const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    ("..", r"\.\."),
    ("/etc/", r"/etc/"),
    ("/usr/", r"/usr/"),
    ("/var/", r"/var/"),
    ("sudo", r"sudo"),
    ("rm -rf", r"rm\s+-rf"),
    ("chmod 777", r"chmod\s+777"),
];

pub(super) fn dangerous_patterns() -> Vec<(&'static str, Regex)> {
    DANGEROUS_PATTERNS
        .iter()
        .map(|(label, pattern)| {
            let regex = Regex::new(&format!("(?i){}", pattern))
                .expect("dangerous command patterns are valid");
            (*label, regex)
        })
        .collect()
}

/// Quote-aware split, degrading to whitespace splitting on unbalanced quotes
pub fn tokenize(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    shlex::split(trimmed)
        .unwrap_or_else(|| trimmed.split_whitespace().map(str::to_string).collect())
}

impl AdmissionController {
    /// Decide whether `command` may run from `current_dir`.
    ///
    /// An empty `accessible_resources` list means no path scope is configured;
    /// the allow-list and dangerous patterns still apply.
    pub fn validate(
        &self,
        command: &str,
        accessible_resources: &[String],
        current_dir: &Path,
    ) -> Verdict {
        let parts = tokenize(command);
        let Some(program) = parts.first() else {
            return Verdict::deny("Empty command");
        };

        if self.config.enforce_allow_list
            && !self.config.allowed_commands.iter().any(|c| c == program)
        {
            return Verdict::deny(format!("Command '{}' is not allowed", program));
        }

        if let Some((label, _)) = self
            .dangerous
            .iter()
            .find(|(_, regex)| regex.is_match(command))
        {
            return Verdict::deny(format!("Command contains dangerous pattern: {}", label));
        }

        let scoped = self.config.path_commands.iter().any(|c| c == program);
        if scoped && !accessible_resources.is_empty() {
            for arg in &parts[1..] {
                if arg.starts_with('-') {
                    continue;
                }
                let stripped = arg.trim_matches(|c| c == '"' || c == '\'');
                if stripped.is_empty() || stripped.starts_with('-') {
                    continue;
                }
                let target = paths::resolve(current_dir, stripped);
                if !paths::within_any(&target, accessible_resources, current_dir) {
                    return Verdict::deny(format!("Access denied to path: {}", target.display()));
                }
            }
        }

        Verdict::allow()
    }
}
