//! Line-buffered fallback console.
//!
//! Used where a pty is unavailable or unwanted. Keystrokes are echoed and
//! buffered locally; a completed line goes through command admission and
//! runs as the student's principal.

use super::events::{EventSink, TerminalEvent};
use crate::admission::{AdmissionController, CommandContext, CommandLogEntry, Effect};
use crate::config::types::Result;
use crate::principal::Principal;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SEPARATOR_WIDTH: usize = 50;

/// Greeting sent when a terminal starts, without the prompt
pub fn welcome_banner(lab_name: &str, folder: &Path) -> String {
    format!(
        "\r\nLab Terminal - {}\r\nWorking Directory: {}\r\nSecurity: Commands are validated for safety\r\n{}\r\n\r\n",
        lab_name,
        folder.display(),
        "=".repeat(SEPARATOR_WIDTH)
    )
}

/// Terminal line endings for command output
fn crlf(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

pub struct ConsoleSession {
    id: String,
    principal: Principal,
    current_dir: PathBuf,
    accessible_resources: Vec<String>,
    buffer: String,
    /// The previous keystroke was `\r`, possibly in an earlier chunk
    after_cr: bool,
    command_count: u64,
    log: Vec<CommandLogEntry>,
    last_activity: DateTime<Utc>,
    admission: Arc<AdmissionController>,
    sink: Arc<dyn EventSink>,
}

impl ConsoleSession {
    pub fn new(
        id: String,
        principal: Principal,
        working_dir: PathBuf,
        accessible_resources: Vec<String>,
        admission: Arc<AdmissionController>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            id,
            principal,
            current_dir: working_dir,
            accessible_resources,
            buffer: String::new(),
            after_cr: false,
            command_count: 0,
            log: Vec::new(),
            last_activity: Utc::now(),
            admission,
            sink,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn current_dir(&self) -> &Path {
        &self.current_dir
    }

    pub fn command_count(&self) -> u64 {
        self.command_count
    }

    pub fn command_log(&self) -> &[CommandLogEntry] {
        &self.log
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// `lab:<basename of current dir>$ `
    pub fn prompt(&self) -> String {
        let base = self
            .current_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.current_dir.display().to_string());
        format!("lab:{}$ ", base)
    }

    /// Apply a chunk of keystrokes
    pub fn handle_input(&mut self, data: &str) -> Result<()> {
        self.last_activity = Utc::now();
        let mut echo = String::new();

        for ch in data.chars() {
            let after_cr = std::mem::replace(&mut self.after_cr, ch == '\r');
            match ch {
                // `\r\n` is a single line ending
                '\n' if after_cr => {}
                '\r' | '\n' => {
                    self.flush_echo(&mut echo)?;
                    let line = std::mem::take(&mut self.buffer);
                    if line.trim().is_empty() {
                        let prompt = self.prompt();
                        self.emit(format!("\r\n{}", prompt))?;
                    } else {
                        self.run_line(line.trim())?;
                    }
                }
                '\x7f' | '\x08' => {
                    if self.buffer.pop().is_some() {
                        echo.push_str("\x08 \x08");
                    }
                }
                '\x03' => {
                    self.flush_echo(&mut echo)?;
                    self.buffer.clear();
                    let prompt = self.prompt();
                    self.emit(format!("^C\r\n{}", prompt))?;
                }
                c if c >= ' ' => {
                    self.buffer.push(c);
                    echo.push(c);
                }
                _ => {}
            }
        }

        self.flush_echo(&mut echo)
    }

    fn flush_echo(&self, echo: &mut String) -> Result<()> {
        if echo.is_empty() {
            return Ok(());
        }
        self.emit(std::mem::take(echo))
    }

    fn emit(&self, text: String) -> Result<()> {
        self.sink.emit(TerminalEvent::output(text))
    }

    fn run_line(&mut self, line: &str) -> Result<()> {
        self.command_count += 1;
        let execution = {
            let ctx = CommandContext {
                session_id: &self.id,
                principal: &self.principal,
                current_dir: &self.current_dir,
                accessible_resources: &self.accessible_resources,
            };
            self.admission.submit(line, &ctx)
        };
        self.log.push(execution.log);

        match execution.effect {
            Effect::Blocked(reason) => {
                let prompt = self.prompt();
                self.emit(format!("\r\nCommand blocked: {}\r\n{}", reason, prompt))
            }
            Effect::Clear => {
                self.sink.emit(TerminalEvent::TerminalClear {})?;
                let prompt = self.prompt();
                self.emit(prompt)
            }
            Effect::ChangeDir(dir) => {
                self.current_dir = dir;
                let prompt = self.prompt();
                self.emit(format!("\r\n{}", prompt))
            }
            Effect::Output(text) => {
                let prompt = self.prompt();
                let body = crlf(text.trim_end_matches('\n'));
                if body.is_empty() {
                    self.emit(format!("\r\n{}", prompt))
                } else {
                    self.emit(format!("\r\n{}\r\n{}", body, prompt))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::AdmissionConfig;
    use crate::utils::env_hygiene::EnvPolicy;
    use crossbeam_channel::Receiver;

    fn console(dir: &Path) -> (ConsoleSession, Receiver<TerminalEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded::<TerminalEvent>();
        let principal =
            Principal::service_fallback("stu_test_00000000", dir.to_path_buf(), "/bin/sh".into());
        let admission = Arc::new(AdmissionController::new(
            AdmissionConfig::default(),
            EnvPolicy::default(),
        ));
        let session = ConsoleSession::new(
            "c1".to_string(),
            principal,
            dir.to_path_buf(),
            Vec::new(),
            admission,
            Arc::new(tx),
        );
        (session, rx)
    }

    fn outputs(rx: &Receiver<TerminalEvent>) -> Vec<String> {
        rx.try_iter()
            .filter_map(|event| match event {
                TerminalEvent::TerminalOutput { data } => Some(data),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn banner_names_lab_and_folder() {
        let banner = welcome_banner("Intro", Path::new("/labs/x"));
        assert!(banner.contains("Lab Terminal - Intro"));
        assert!(banner.contains("Working Directory: /labs/x"));
    }

    #[test]
    fn echo_and_backspace() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, rx) = console(dir.path());
        session.handle_input("ab").unwrap();
        session.handle_input("\x7f").unwrap();
        assert_eq!(outputs(&rx), vec!["ab".to_string(), "\x08 \x08".to_string()]);

        session.handle_input("\x7f").unwrap();
        session.handle_input("\x7f").unwrap();
        // nothing left to erase on the second press
        assert_eq!(outputs(&rx), vec!["\x08 \x08".to_string()]);
    }

    #[test]
    fn ctrl_c_discards_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, rx) = console(dir.path());
        session.handle_input("ls\x03").unwrap();
        let out = outputs(&rx);
        assert_eq!(out.last().unwrap(), &format!("^C\r\n{}", session.prompt()));
        assert_eq!(session.command_count(), 0);
    }

    #[test]
    fn enter_runs_command_and_reprompts() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, rx) = console(dir.path());
        session.handle_input("echo hi\r").unwrap();
        let out = outputs(&rx);
        let prompt = session.prompt();
        assert_eq!(out.last().unwrap(), &format!("\r\nhi\r\n{}", prompt));
        assert_eq!(session.command_count(), 1);
        assert_eq!(session.command_log()[0].exit_code, 0);
    }

    #[test]
    fn crlf_submits_once() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, rx) = console(dir.path());
        session.handle_input("echo one\r\n").unwrap();
        session.handle_input("echo two\r").unwrap();
        session.handle_input("\n").unwrap();
        assert_eq!(session.command_count(), 2);

        let prompt = session.prompt();
        let out = outputs(&rx);
        let prompts = out.iter().filter(|text| text.ends_with(&prompt)).count();
        assert_eq!(prompts, 2);

        // bare line feeds still submit
        session.handle_input("echo three\n\n").unwrap();
        assert_eq!(session.command_count(), 3);
        assert_eq!(outputs(&rx).last().unwrap(), &format!("\r\n{}", prompt));
    }

    #[test]
    fn blocked_command_reports_reason() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, rx) = console(dir.path());
        session.handle_input("rm x\r").unwrap();
        let out = outputs(&rx);
        assert!(out
            .last()
            .unwrap()
            .starts_with("\r\nCommand blocked: Command 'rm' is not allowed"));
        assert!(!session.command_log()[0].allowed);
    }

    #[test]
    fn clear_emits_clear_event() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, rx) = console(dir.path());
        session.handle_input("clear\n").unwrap();
        let events: Vec<_> = rx.try_iter().collect();
        assert!(events.contains(&TerminalEvent::TerminalClear {}));
    }

    #[test]
    fn cd_updates_prompt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        let (mut session, rx) = console(dir.path());
        session.handle_input("cd src\r").unwrap();
        assert_eq!(session.prompt(), "lab:src$ ");
        assert_eq!(outputs(&rx).last().unwrap(), "\r\nlab:src$ ");
    }
}
