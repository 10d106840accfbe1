//! Lab definitions: template, parameters, checkpoint rules, scoring.
//!
//! Definitions arrive as JSON from the persistence collaborator and are
//! validated once at load time. Everything downstream works on the typed
//! form and never re-checks shape.

use crate::config::types::{LabError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// How a submitted answer is decoded before comparison
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecodeMethod {
    #[default]
    Plain,
    Base64,
    Hex,
    Reverse,
    Md5,
    Sha1,
    Sha256,
}

impl std::fmt::Display for DecodeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DecodeMethod::Plain => "plain",
            DecodeMethod::Base64 => "base64",
            DecodeMethod::Hex => "hex",
            DecodeMethod::Reverse => "reverse",
            DecodeMethod::Md5 => "md5",
            DecodeMethod::Sha1 => "sha1",
            DecodeMethod::Sha256 => "sha256",
        };
        write!(f, "{}", name)
    }
}

/// What a checkpoint compares the decoded answer against
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    /// A literal expected answer
    Literal(String),
    /// A per-student flag derived from the date, email and this secret template
    Flag { secret: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlagRule {
    pub secret: String,
}

#[derive(Serialize, Deserialize)]
struct RawCheckpointRule {
    #[serde(default)]
    decode: DecodeMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    flag: Option<FlagRule>,
    #[serde(default)]
    case_sensitive: bool,
    points: u32,
}

/// One graded question of a lab
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawCheckpointRule", into = "RawCheckpointRule")]
pub struct CheckpointRule {
    pub decode: DecodeMethod,
    pub expectation: Expectation,
    pub case_sensitive: bool,
    pub points: u32,
}

impl From<CheckpointRule> for RawCheckpointRule {
    fn from(rule: CheckpointRule) -> Self {
        let (expected, flag) = match rule.expectation {
            Expectation::Literal(expected) => (Some(expected), None),
            Expectation::Flag { secret } => (None, Some(FlagRule { secret })),
        };
        Self {
            decode: rule.decode,
            expected,
            flag,
            case_sensitive: rule.case_sensitive,
            points: rule.points,
        }
    }
}

impl TryFrom<RawCheckpointRule> for CheckpointRule {
    type Error = String;

    fn try_from(raw: RawCheckpointRule) -> std::result::Result<Self, Self::Error> {
        let expectation = match (raw.expected, raw.flag) {
            (Some(expected), None) => Expectation::Literal(expected),
            (None, Some(flag)) => Expectation::Flag {
                secret: flag.secret,
            },
            (Some(_), Some(_)) => {
                return Err("checkpoint sets both 'expected' and 'flag'".to_string())
            }
            (None, None) => return Err("checkpoint needs 'expected' or 'flag'".to_string()),
        };
        Ok(Self {
            decode: raw.decode,
            expectation,
            case_sensitive: raw.case_sensitive,
            points: raw.points,
        })
    }
}

/// A token with its candidate values and optional target file
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabParameter {
    /// Literal token, e.g. `${fieldName}`
    pub token: String,
    pub values: Vec<String>,
    /// File (relative to the student folder) rewritten with the resolved value
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoringConfig {
    pub max_score: u32,
    pub min_score: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            max_score: 100,
            min_score: 60,
        }
    }
}

/// Immutable description of one lab
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabDefinition {
    pub name: String,
    /// Template folder name under the templates root
    pub template: String,
    #[serde(default)]
    pub accessible_resources: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<LabParameter>,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointRule>,
    #[serde(default)]
    pub run_commands: Vec<String>,
    /// Shell build step run in the student folder after the run-commands
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub scoring: ScoringConfig,
}

impl LabDefinition {
    /// Parse and validate a definition from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let lab: LabDefinition = serde_json::from_str(text)
            .map_err(|e| LabError::Config(format!("invalid lab definition: {}", e)))?;
        lab.validate()?;
        Ok(lab)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            LabError::Config(format!("Failed to read lab definition {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn num_checkpoints(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn total_points(&self) -> u64 {
        self.checkpoints.iter().map(|rule| u64::from(rule.points)).sum()
    }

    /// Structural checks that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(LabError::Config("lab name cannot be empty".to_string()));
        }
        if self.template.trim().is_empty()
            || self.template.contains('/')
            || self.template.contains("..")
        {
            return Err(LabError::Config(format!(
                "lab template '{}' must be a single folder name",
                self.template
            )));
        }

        let mut seen = HashSet::new();
        for param in &self.parameters {
            if param.token.trim().is_empty() {
                return Err(LabError::Config(format!(
                    "lab '{}' has a parameter with an empty token",
                    self.name
                )));
            }
            if param.values.is_empty() {
                return Err(LabError::Config(format!(
                    "parameter {} has no candidate values",
                    param.token
                )));
            }
            if !seen.insert(param.token.as_str()) {
                return Err(LabError::Config(format!(
                    "parameter {} is declared twice",
                    param.token
                )));
            }
            if let Some(file) = &param.file {
                if Path::new(file).is_absolute() || file.split('/').any(|part| part == "..") {
                    return Err(LabError::Config(format!(
                        "parameter {} targets '{}' outside the student folder",
                        param.token, file
                    )));
                }
            }
        }

        if self.scoring.min_score > self.scoring.max_score {
            return Err(LabError::Config(format!(
                "min_score {} exceeds max_score {}",
                self.scoring.min_score, self.scoring.max_score
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "name": "SQL Injection Lab",
        "template": "sql-injection-template",
        "accessible_resources": ["./src", "./database"],
        "parameters": [
            { "token": "${fieldName}", "values": ["username", "email"] },
            { "token": "${tableName}", "values": ["users"], "file": "src/config.php" }
        ],
        "run_commands": ["python setup_db.py --field ${fieldName} --table ${tableName}"],
        "checkpoints": [
            { "decode": "base64", "expected": "flag1", "points": 10 },
            { "flag": { "secret": "s3cret_${STUDENT}" }, "case_sensitive": true, "points": 20 }
        ],
        "scoring": { "max_score": 100, "min_score": 50 }
    }"#;

    #[test]
    fn parses_and_types_checkpoints() {
        let lab = LabDefinition::from_json(SAMPLE).unwrap();
        assert_eq!(lab.num_checkpoints(), 2);
        assert_eq!(lab.total_points(), 30);
        assert_eq!(lab.checkpoints[0].decode, DecodeMethod::Base64);
        assert!(!lab.checkpoints[0].case_sensitive);
        assert_eq!(
            lab.checkpoints[1].expectation,
            Expectation::Flag {
                secret: "s3cret_${STUDENT}".to_string()
            }
        );
    }

    #[test]
    fn checkpoint_without_expectation_fails_at_load() {
        let text = r#"{ "name": "x", "template": "t", "checkpoints": [ { "points": 1 } ] }"#;
        assert!(LabDefinition::from_json(text).is_err());
    }

    #[test]
    fn unknown_decode_method_fails_at_load() {
        let text = r#"{ "name": "x", "template": "t",
            "checkpoints": [ { "decode": "rot13", "expected": "a", "points": 1 } ] }"#;
        assert!(LabDefinition::from_json(text).is_err());
    }

    #[test]
    fn duplicate_tokens_are_rejected() {
        let text = r#"{ "name": "x", "template": "t", "parameters": [
            { "token": "${a}", "values": ["1"] }, { "token": "${a}", "values": ["2"] } ] }"#;
        assert!(LabDefinition::from_json(text).is_err());
    }

    #[test]
    fn parameter_file_cannot_escape_student_folder() {
        let text = r#"{ "name": "x", "template": "t", "parameters": [
            { "token": "${a}", "values": ["1"], "file": "../outside.txt" } ] }"#;
        assert!(LabDefinition::from_json(text).is_err());
    }
}
