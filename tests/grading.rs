//! Integration tests for submission grading

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::NaiveDate;
use labbox::config::types::LabError;
use labbox::grading::{compute_expected_flag, decode, score, SubmissionContext};
use labbox::lab::definition::{DecodeMethod, LabDefinition};

fn ctx(email: &str, date: NaiveDate) -> SubmissionContext {
    SubmissionContext {
        email: email.to_string(),
        date,
    }
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn base64_answer_matches_case_insensitively() {
    let lab = LabDefinition::from_json(
        r#"{
            "name": "Encodings",
            "template": "enc",
            "checkpoints": [
                { "decode": "base64", "expected": "flag1", "case_sensitive": false, "points": 10 }
            ]
        }"#,
    )
    .unwrap();

    let answer = STANDARD.encode("FLAG1");
    let report = score(&lab, &[answer], &ctx("a@x.io", day(2024, 3, 7))).unwrap();

    let result = &report.results[0];
    assert_eq!(result.decoded.as_deref(), Some("FLAG1"));
    assert!(result.passed);
    assert_eq!(result.points_awarded, 10);
    assert_eq!(report.score, 100);
    assert!(report.passed);
}

#[test]
fn wrong_answer_count_is_rejected_before_scoring() {
    let lab = LabDefinition::from_json(
        r#"{
            "name": "Three",
            "template": "three",
            "checkpoints": [
                { "expected": "a", "points": 1 },
                { "expected": "b", "points": 1 },
                { "expected": "c", "points": 1 }
            ]
        }"#,
    )
    .unwrap();

    let answers = vec!["a".to_string(), "b".to_string()];
    let err = score(&lab, &answers, &ctx("a@x.io", day(2024, 3, 7))).unwrap_err();
    assert!(matches!(err, LabError::InvalidSubmission(_)));
}

#[test]
fn todays_flag_passes_and_yesterdays_fails() {
    let lab = LabDefinition::from_json(
        r#"{
            "name": "Flags",
            "template": "flags",
            "checkpoints": [
                { "flag": { "secret": "vault-${STUDENT}" }, "case_sensitive": true, "points": 5 }
            ],
            "scoring": { "max_score": 100, "min_score": 100 }
        }"#,
    )
    .unwrap();

    let today = day(2024, 3, 7);
    let yesterday = day(2024, 3, 6);
    let email = "student@uni.edu";

    let todays = compute_expected_flag(today, email, "vault-${STUDENT}");
    let report = score(&lab, &[todays], &ctx(email, today)).unwrap();
    assert!(report.passed);

    let stale = compute_expected_flag(yesterday, email, "vault-${STUDENT}");
    let report = score(&lab, &[stale], &ctx(email, today)).unwrap();
    assert!(!report.passed);
    assert_eq!(report.score, 0);
}

#[test]
fn another_students_flag_fails() {
    let lab = LabDefinition::from_json(
        r#"{ "name": "Flags", "template": "flags",
             "checkpoints": [ { "flag": { "secret": "s" }, "points": 1 } ] }"#,
    )
    .unwrap();
    let date = day(2024, 3, 7);
    let borrowed = compute_expected_flag(date, "friend@uni.edu", "s");
    let report = score(&lab, &[borrowed], &ctx("me@uni.edu", date)).unwrap();
    assert!(!report.results[0].passed);
}

#[test]
fn decoding_inverts_encoding() {
    for text in ["", "plain", "with spaces and ünïcödé", "🚩{x}"] {
        let encoded = STANDARD.encode(text);
        assert_eq!(decode(&encoded, DecodeMethod::Base64).unwrap(), text);

        let reversed: String = text.chars().rev().collect();
        assert_eq!(decode(&reversed, DecodeMethod::Reverse).unwrap(), text);

        assert_eq!(decode(&hex::encode(text), DecodeMethod::Hex).unwrap(), text);
    }
}

#[test]
fn invalid_utf8_payload_is_a_decode_error() {
    let encoded = STANDARD.encode([0xffu8, 0xfe]);
    assert!(matches!(
        decode(&encoded, DecodeMethod::Base64),
        Err(LabError::Decode(_))
    ));
}
