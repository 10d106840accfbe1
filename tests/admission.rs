//! Integration tests for command admission
//!
//! Exercises the validator the way the console and the CLI drive it.

use labbox::admission::AdmissionController;
use labbox::config::types::AdmissionConfig;
use labbox::utils::env_hygiene::EnvPolicy;
use std::path::Path;

fn controller(allowed: &[&str]) -> AdmissionController {
    AdmissionController::new(
        AdmissionConfig {
            allowed_commands: allowed.iter().map(|s| s.to_string()).collect(),
            ..AdmissionConfig::default()
        },
        EnvPolicy::default(),
    )
}

#[test]
fn traversal_out_of_the_lab_is_blocked() {
    let admission = controller(&["ls", "cat"]);
    let verdict = admission.validate("cat ../../etc/passwd", &[], Path::new("/labs/s1"));
    assert!(!verdict.allowed);
    assert!(verdict.reason.contains(".."), "reason: {}", verdict.reason);
}

#[test]
fn path_scope_follows_accessible_resources() {
    let admission = controller(&["ls", "cat"]);
    let resources = vec!["./src".to_string()];
    let cwd = Path::new("/labs/s1");

    let inside = admission.validate("cat /labs/s1/src/app.py", &resources, cwd);
    assert!(inside.allowed, "reason: {}", inside.reason);

    let outside = admission.validate("cat /labs/s1/other/app.py", &resources, cwd);
    assert!(!outside.allowed);
    assert_eq!(outside.reason, "Access denied to path: /labs/s1/other/app.py");
}

#[test]
fn commands_outside_the_allow_list_name_their_token() {
    let admission = controller(&["ls", "cat"]);
    for command in ["vim notes.txt", "curl http://x", "bash", "python3 -c 1"] {
        let verdict = admission.validate(command, &[], Path::new("/labs/s1"));
        let token = command.split_whitespace().next().unwrap();
        assert!(!verdict.allowed, "{} should be blocked", command);
        assert_eq!(verdict.reason, format!("Command '{}' is not allowed", token));
    }
}

#[test]
fn dangerous_substrings_are_blocked_in_any_case() {
    let admission = controller(&["ls", "cat", "echo"]);
    for command in [
        "echo x && sudo id",
        "echo x; RM -RF /tmp/x",
        "ls && chmod 777 secret",
        "cat ../../etc/passwd",
        "cat /ETC/shadow",
    ] {
        let verdict = admission.validate(command, &[], Path::new("/labs/s1"));
        assert!(!verdict.allowed, "{} should be blocked", command);
        assert!(verdict.reason.starts_with("Command contains dangerous pattern: "));
    }
}

#[test]
fn disabled_allow_list_still_applies_patterns() {
    let admission = AdmissionController::new(
        AdmissionConfig {
            enforce_allow_list: false,
            ..AdmissionConfig::default()
        },
        EnvPolicy::default(),
    );
    assert!(admission.validate("vim notes.txt", &[], Path::new("/labs/s1")).allowed);
    assert!(!admission.validate("vim /etc/passwd", &[], Path::new("/labs/s1")).allowed);
}

#[test]
fn empty_command_is_refused() {
    let admission = controller(&["ls"]);
    let verdict = admission.validate("   ", &[], Path::new("/"));
    assert!(!verdict.allowed);
    assert_eq!(verdict.reason, "Empty command");
}
