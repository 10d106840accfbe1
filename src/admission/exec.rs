//! Execution of admitted commands under a principal.

use super::gate::tokenize;
use super::paths;
use super::{AdmissionController, CommandContext, CommandLogEntry, Effect, Execution};
use crate::config::types::LabError;
use crate::observability::audit::events;
use crate::utils::env_hygiene::IsolatedEnv;
use crate::utils::output::OutputLimits;
use crate::utils::process::{run_bounded, RunOutcome};
use chrono::Utc;
use std::borrow::Cow;
use std::process::Command;

pub const CD_FAILURE: &str = "cd: directory not accessible or not found";
pub const TIMEOUT_OUTPUT: &str = "Command timed out";

/// `ls`→`dir` and `cat`→`type` on targets without a POSIX userland
pub fn platform_alias(command: &str) -> Cow<'_, str> {
    if cfg!(windows) {
        let lower = command.to_lowercase();
        if lower == "ls" {
            return Cow::Owned("dir".to_string());
        }
        if lower.starts_with("ls ") {
            return Cow::Owned(format!("dir {}", &command[3..]));
        }
        if lower.starts_with("cat ") {
            return Cow::Owned(format!("type {}", &command[4..]));
        }
    }
    Cow::Borrowed(command)
}

fn entry(command: &str, output: impl Into<String>, exit_code: i32) -> CommandLogEntry {
    CommandLogEntry {
        command: command.to_string(),
        allowed: true,
        blocked_reason: None,
        output: output.into(),
        exit_code,
        timestamp: Utc::now(),
    }
}

impl AdmissionController {
    /// Validate then execute. A refused command is logged and never spawned.
    pub fn submit(&self, command: &str, ctx: &CommandContext<'_>) -> Execution {
        let verdict = self.validate(command, ctx.accessible_resources, ctx.current_dir);
        if !verdict.allowed {
            events::command_blocked(ctx.session_id, &ctx.principal.name, command, &verdict.reason);
            let output = format!("Command blocked: {}", verdict.reason);
            return Execution {
                timed_out: false,
                effect: Effect::Blocked(verdict.reason.clone()),
                log: CommandLogEntry {
                    command: command.to_string(),
                    allowed: false,
                    blocked_reason: Some(verdict.reason),
                    output,
                    exit_code: 1,
                    timestamp: Utc::now(),
                },
            };
        }
        self.execute(command, ctx)
    }

    /// Execute an already admitted command.
    ///
    /// Never fails: errors become `Error: <message>` output with exit code 1.
    pub fn execute(&self, command: &str, ctx: &CommandContext<'_>) -> Execution {
        let trimmed = command.trim();
        let lower = trimmed.to_lowercase();

        let execution = if lower == "clear" || lower == "cls" {
            Execution {
                timed_out: false,
                effect: Effect::Clear,
                log: entry(trimmed, "Terminal cleared", 0),
            }
        } else if lower == "cd" || lower.starts_with("cd ") {
            self.change_dir(trimmed, ctx)
        } else {
            self.spawn(trimmed, ctx)
        };

        events::command_executed(
            ctx.session_id,
            &ctx.principal.name,
            trimmed,
            execution.log.exit_code,
        );
        execution
    }

    fn change_dir(&self, command: &str, ctx: &CommandContext<'_>) -> Execution {
        let Some(target) = tokenize(command).into_iter().nth(1) else {
            return Execution {
                timed_out: false,
                effect: Effect::Output(String::new()),
                log: entry(command, "", 0),
            };
        };

        let new_dir = paths::resolve(ctx.current_dir, &target);
        let in_scope = ctx.accessible_resources.is_empty()
            || paths::within_any(&new_dir, ctx.accessible_resources, ctx.current_dir);

        if new_dir.is_dir() && in_scope {
            Execution {
                timed_out: false,
                log: entry(command, "", 0),
                effect: Effect::ChangeDir(new_dir),
            }
        } else {
            Execution {
                timed_out: false,
                effect: Effect::Output(CD_FAILURE.to_string()),
                log: entry(command, CD_FAILURE, 1),
            }
        }
    }

    fn spawn(&self, command: &str, ctx: &CommandContext<'_>) -> Execution {
        let command_line = platform_alias(command);

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command_line.as_ref()).current_dir(ctx.current_dir);
        IsolatedEnv::for_principal(ctx.principal, &self.env_policy).apply(&mut cmd);
        ctx.principal.bind_command(&mut cmd);

        let limits = OutputLimits {
            stream_limit: self.config.output_limit_bytes,
        };
        match run_bounded(cmd, self.config.command_timeout(), limits) {
            Ok(RunOutcome::Exited { code, output, .. }) => {
                let mut text = output.stdout_text();
                let stderr = output.stderr_text();
                if !stderr.is_empty() {
                    text.push('\n');
                    text.push_str(&stderr);
                }
                Execution {
                    timed_out: false,
                    effect: Effect::Output(text.clone()),
                    log: entry(command, text, code),
                }
            }
            Ok(RunOutcome::TimedOut { .. }) => {
                events::command_timeout(
                    ctx.session_id,
                    &ctx.principal.name,
                    command,
                    self.config.command_timeout_secs,
                );
                Execution {
                    timed_out: true,
                    effect: Effect::Output(TIMEOUT_OUTPUT.to_string()),
                    log: entry(command, TIMEOUT_OUTPUT, 124),
                }
            }
            Err(e) => {
                let message = match e {
                    LabError::Process(msg) => msg,
                    other => other.to_string(),
                };
                let text = format!("Error: {}", message);
                Execution {
                    timed_out: false,
                    effect: Effect::Output(text.clone()),
                    log: entry(command, text, 1),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::AdmissionConfig;
    use crate::principal::Principal;
    use crate::utils::env_hygiene::EnvPolicy;
    use std::path::Path;

    fn me(home: &Path) -> Principal {
        Principal::service_fallback("stu_test_00000000", home.to_path_buf(), "/bin/sh".into())
    }

    fn controller() -> AdmissionController {
        AdmissionController::new(
            AdmissionConfig {
                command_timeout_secs: 1,
                ..AdmissionConfig::default()
            },
            EnvPolicy::default(),
        )
    }

    #[test]
    fn alias_is_identity_on_unix() {
        assert_eq!(platform_alias("ls -la"), "ls -la");
        assert_eq!(platform_alias("cat a.txt"), "cat a.txt");
    }

    #[test]
    fn echo_runs_in_isolated_environment() {
        let dir = tempfile::tempdir().unwrap();
        let principal = me(dir.path());
        let ctx = CommandContext {
            session_id: "s",
            principal: &principal,
            current_dir: dir.path(),
            accessible_resources: &[],
        };
        let execution = controller().submit("echo $USER", &ctx);
        assert_eq!(execution.effect, Effect::Output("stu_test_00000000\n".to_string()));
        assert_eq!(execution.log.exit_code, 0);
        assert!(execution.log.allowed);
    }

    #[test]
    fn clear_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let principal = me(dir.path());
        let ctx = CommandContext {
            session_id: "s",
            principal: &principal,
            current_dir: dir.path(),
            accessible_resources: &[],
        };
        let execution = controller().execute("CLEAR", &ctx);
        assert_eq!(execution.effect, Effect::Clear);
        assert_eq!(execution.log.output, "Terminal cleared");
    }

    #[test]
    fn cd_into_scope_changes_dir_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::create_dir(dir.path().join("other")).unwrap();
        let principal = me(dir.path());
        let resources = vec!["./src".to_string()];
        let ctx = CommandContext {
            session_id: "s",
            principal: &principal,
            current_dir: dir.path(),
            accessible_resources: &resources,
        };

        let ok = controller().submit("cd src", &ctx);
        assert_eq!(ok.effect, Effect::ChangeDir(dir.path().join("src")));

        let denied = controller().execute("cd other", &ctx);
        assert_eq!(denied.effect, Effect::Output(CD_FAILURE.to_string()));
        assert_eq!(denied.log.exit_code, 1);

        let missing = controller().execute("cd src/nope", &ctx);
        assert_eq!(missing.log.exit_code, 1);
    }

    #[test]
    fn cd_honors_quoted_directory_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("my dir")).unwrap();
        let principal = me(dir.path());
        let ctx = CommandContext {
            session_id: "s",
            principal: &principal,
            current_dir: dir.path(),
            accessible_resources: &[],
        };

        let quoted = controller().execute(r#"cd "my dir""#, &ctx);
        assert_eq!(quoted.effect, Effect::ChangeDir(dir.path().join("my dir")));

        let escaped = controller().execute(r"cd my\ dir", &ctx);
        assert_eq!(escaped.effect, Effect::ChangeDir(dir.path().join("my dir")));
    }

    #[test]
    fn refusals_and_timeouts_map_to_typed_errors() {
        let dir = tempfile::tempdir().unwrap();
        let principal = me(dir.path());
        let ctx = CommandContext {
            session_id: "s",
            principal: &principal,
            current_dir: dir.path(),
            accessible_resources: &[],
        };
        let controller = controller();
        let timeout = controller.config().command_timeout();

        let err = controller.submit("rm -rf x", &ctx).into_result(timeout).unwrap_err();
        assert!(matches!(err, LabError::AdmissionDenied(_)));
        assert_eq!(err.exit_code(), 2);

        let err = controller.execute("sleep 5", &ctx).into_result(timeout).unwrap_err();
        assert!(matches!(err, LabError::ExecutionTimeout(_)));
        assert_eq!(err.exit_code(), 124);

        let log = controller.submit("echo ok", &ctx).into_result(timeout).unwrap();
        assert_eq!(log.output, "ok\n");

        let verdict = controller.validate("sudo id", &[], dir.path());
        assert!(matches!(verdict.into_result(), Err(LabError::AdmissionDenied(_))));
    }

    #[test]
    fn blocked_command_is_logged_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let principal = me(dir.path());
        let ctx = CommandContext {
            session_id: "s",
            principal: &principal,
            current_dir: dir.path(),
            accessible_resources: &[],
        };
        let execution = controller().submit("echo x; sudo id", &ctx);
        assert!(!execution.log.allowed);
        assert_eq!(
            execution.log.blocked_reason.as_deref(),
            Some("Command contains dangerous pattern: sudo")
        );
        assert!(matches!(execution.effect, Effect::Blocked(_)));
    }
}
