//! Submission scoring.

use super::decode::decode;
use super::flag::compute_expected_flag;
use crate::config::types::{LabError, Result};
use crate::lab::definition::{CheckpointRule, Expectation, LabDefinition};
use crate::observability::audit::events;
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Who submitted, and which local day flags are computed for
#[derive(Clone, Debug)]
pub struct SubmissionContext {
    pub email: String,
    pub date: NaiveDate,
}

impl SubmissionContext {
    pub fn today(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            date: Local::now().date_naive(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointResult {
    pub index: usize,
    pub answer: String,
    /// Absent when decoding failed
    pub decoded: Option<String>,
    pub expected: String,
    pub passed: bool,
    pub points_awarded: u32,
    pub points_possible: u32,
    /// Set when the answer could not be decoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decode_error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GradeReport {
    pub lab: String,
    pub email: String,
    pub results: Vec<CheckpointResult>,
    pub earned_points: u64,
    pub total_points: u64,
    pub score: u32,
    pub max_score: u32,
    pub passed: bool,
    pub graded_at: DateTime<Utc>,
}

/// Score `answers` (one per checkpoint, in order) against `lab`.
///
/// `score = round(earned / total * max_score)`, or 0 when the lab has no
/// points at all. Passing means `score >= min_score`.
pub fn score(lab: &LabDefinition, answers: &[String], ctx: &SubmissionContext) -> Result<GradeReport> {
    if answers.len() != lab.num_checkpoints() {
        let reason = format!(
            "expected {} answers, got {}",
            lab.num_checkpoints(),
            answers.len()
        );
        events::submission_rejected(&lab.name, &ctx.email, &reason);
        return Err(LabError::InvalidSubmission(reason));
    }

    let results: Vec<CheckpointResult> = lab
        .checkpoints
        .iter()
        .zip(answers)
        .enumerate()
        .map(|(index, (rule, answer))| grade_checkpoint(index, rule, answer, ctx))
        .collect();

    let earned_points: u64 = results.iter().map(|r| u64::from(r.points_awarded)).sum();
    let total_points = lab.total_points();
    let max_score = lab.scoring.max_score;
    let score = if total_points == 0 {
        0
    } else {
        (earned_points as f64 / total_points as f64 * max_score as f64).round() as u32
    };
    let passed = score >= lab.scoring.min_score;

    events::submission_graded(&lab.name, &ctx.email, score, passed);
    log::info!(
        "Graded {} for {}: {}/{} points, score {}",
        lab.name,
        ctx.email,
        earned_points,
        total_points,
        score
    );

    Ok(GradeReport {
        lab: lab.name.clone(),
        email: ctx.email.clone(),
        results,
        earned_points,
        total_points,
        score,
        max_score,
        passed,
        graded_at: Utc::now(),
    })
}

fn grade_checkpoint(
    index: usize,
    rule: &CheckpointRule,
    answer: &str,
    ctx: &SubmissionContext,
) -> CheckpointResult {
    let expected = match &rule.expectation {
        Expectation::Literal(value) => value.clone(),
        Expectation::Flag { secret } => compute_expected_flag(ctx.date, &ctx.email, secret),
    };
    let (decoded, decode_error) = match decode(answer, rule.decode) {
        Ok(decoded) => (Some(decoded), None),
        Err(e) => (None, Some(e.to_string())),
    };
    let passed = decoded
        .as_deref()
        .map(|value| matches(value, &expected, rule.case_sensitive))
        .unwrap_or(false);

    CheckpointResult {
        index,
        answer: answer.to_string(),
        decoded,
        expected,
        passed,
        points_awarded: if passed { rule.points } else { 0 },
        points_possible: rule.points,
        decode_error,
    }
}

fn matches(decoded: &str, expected: &str, case_sensitive: bool) -> bool {
    let (decoded, expected) = (decoded.trim(), expected.trim());
    if case_sensitive {
        decoded == expected
    } else {
        decoded.to_lowercase() == expected.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab(checkpoints: &str, scoring: &str) -> LabDefinition {
        LabDefinition::from_json(&format!(
            r#"{{ "name": "crypto", "template": "tpl", "checkpoints": {}, "scoring": {} }}"#,
            checkpoints, scoring
        ))
        .unwrap()
    }

    fn ctx() -> SubmissionContext {
        SubmissionContext {
            email: "a@x.io".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(),
        }
    }

    #[test]
    fn case_folding_respects_flag() {
        assert!(matches("Secret", "secret", false));
        assert!(!matches("Secret", "secret", true));
        assert!(matches(" secret\n", "secret", true));
    }

    #[test]
    fn zero_total_points_scores_zero() {
        let lab = lab(
            r#"[{ "expected": "x", "points": 0 }]"#,
            r#"{ "max_score": 100, "min_score": 0 }"#,
        );
        let report = score(&lab, &["x".to_string()], &ctx()).unwrap();
        assert_eq!(report.score, 0);
        assert!(report.passed);
    }

    #[test]
    fn decode_failure_fails_only_that_checkpoint() {
        let lab = lab(
            r#"[{ "decode": "base64", "expected": "secret", "points": 5 },
                { "expected": "b", "points": 5 }]"#,
            r#"{ "max_score": 100, "min_score": 50 }"#,
        );
        let report = score(&lab, &["%%%".to_string(), "b".to_string()], &ctx()).unwrap();
        assert!(!report.results[0].passed);
        assert!(report.results[0].decode_error.is_some());
        assert!(report.results[1].passed);
        assert_eq!(report.score, 50);
        assert!(report.passed);
    }

    #[test]
    fn score_is_rounded_to_nearest() {
        let lab = lab(
            r#"[{ "expected": "a", "points": 1 }, { "expected": "b", "points": 1 },
                { "expected": "c", "points": 1 }]"#,
            r#"{ "max_score": 100, "min_score": 60 }"#,
        );
        let answers: Vec<String> = ["a", "b", "x"].iter().map(|s| s.to_string()).collect();
        let report = score(&lab, &answers, &ctx()).unwrap();
        assert_eq!(report.score, 67);
        assert!(report.passed);
    }

    #[test]
    fn point_totals_beyond_u32_do_not_wrap() {
        let lab = lab(
            r#"[{ "expected": "a", "points": 4294967295 },
                { "expected": "b", "points": 4294967295 }]"#,
            r#"{ "max_score": 100, "min_score": 50 }"#,
        );
        assert_eq!(lab.total_points(), 2 * u64::from(u32::MAX));
        let answers: Vec<String> = ["a", "x"].iter().map(|s| s.to_string()).collect();
        let report = score(&lab, &answers, &ctx()).unwrap();
        assert_eq!(report.earned_points, u64::from(u32::MAX));
        assert_eq!(report.total_points, 2 * u64::from(u32::MAX));
        assert_eq!(report.score, 50);
        assert!(report.passed);
    }
}
