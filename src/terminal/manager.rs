//! Registry of live terminal sessions.

use super::events::{EventSink, TerminalEvent};
use super::session::{SessionState, TerminalSession, Utf8Carry};
use crate::config::types::{LabError, Result, TerminalConfig};
use crate::kernel::pty::{open_pty, spawn_on_slave, wait_readable};
use crate::observability::audit::events;
use crate::principal::Principal;
use crate::utils::env_hygiene::{EnvPolicy, IsolatedEnv};
use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use uuid::Uuid;

/// Shown to the client when the shell goes away on its own
pub const SESSION_ENDED: &str = "Terminal session ended";

type SessionTable = Mutex<HashMap<String, Arc<TerminalSession>>>;

/// Opens, drives and closes pty sessions
pub struct TerminalManager {
    config: TerminalConfig,
    env_policy: EnvPolicy,
    sessions: Arc<SessionTable>,
}

impl TerminalManager {
    pub fn new(config: TerminalConfig) -> Self {
        let env_policy = EnvPolicy::from_terminal(&config);
        Self {
            config,
            env_policy,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Arc<TerminalSession>>>> {
        self.sessions
            .lock()
            .map_err(|_| LabError::SessionExpired("session table lock poisoned".to_string()))
    }

    /// Start the configured shell as `principal` in `working_dir` and begin
    /// streaming its output to `sink`. Returns the session id.
    pub fn open(
        &self,
        principal: &Principal,
        working_dir: &Path,
        sink: Arc<dyn EventSink>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        match self.spawn_session(&id, principal, working_dir, sink) {
            Ok(()) => Ok(id),
            Err(e) => {
                events::session_failed(&principal.name, &e.to_string());
                Err(e)
            }
        }
    }

    fn spawn_session(
        &self,
        id: &str,
        principal: &Principal,
        working_dir: &Path,
        sink: Arc<dyn EventSink>,
    ) -> Result<()> {
        let pair = open_pty(self.config.default_rows, self.config.default_cols)?;
        let reader_master = pair.master.try_clone()?;

        let mut cmd = Command::new(&self.config.shell);
        cmd.args(&self.config.shell_args).current_dir(working_dir);
        IsolatedEnv::for_principal(principal, &self.env_policy).apply(&mut cmd);
        principal.bind_command(&mut cmd);

        let child = spawn_on_slave(cmd, &pair.slave)?;
        drop(pair.slave);

        let session = Arc::new(TerminalSession::new(
            id.to_string(),
            principal.clone(),
            child,
            pair.master,
            Duration::from_millis(self.config.kill_grace_ms),
        ));
        session.mark_running();
        self.table()?.insert(id.to_string(), session.clone());

        let reader = ReaderLoop {
            session: session.clone(),
            master: reader_master,
            sink,
            table: Arc::downgrade(&self.sessions),
            poll_interval: self.config.poll_interval(),
            chunk: self.config.read_chunk_bytes.max(1),
        };
        let spawned = std::thread::Builder::new()
            .name(format!("pty-{}", &id[..8]))
            .spawn(move || reader.run());
        match spawned {
            Ok(handle) => session.set_reader(handle),
            Err(e) => {
                session.teardown("reader thread failed to start");
                self.table()?.remove(id);
                return Err(LabError::Process(format!("Failed to start reader: {}", e)));
            }
        }

        events::session_opened(id, &principal.name, Some(session.pid()));
        log::info!(
            "Terminal session {} opened for {} (pid {})",
            id,
            principal.name,
            session.pid()
        );
        Ok(())
    }

    pub fn session(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.table().ok().and_then(|table| table.get(id).cloned())
    }

    fn live(&self, id: &str) -> Result<Arc<TerminalSession>> {
        self.session(id)
            .ok_or_else(|| LabError::SessionExpired(format!("no live session {}", id)))
    }

    pub fn write_input(&self, id: &str, data: &[u8]) -> Result<()> {
        self.live(id)?.write_input(data)
    }

    pub fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<()> {
        self.live(id)?.resize(rows, cols)
    }

    /// Close a session. Unknown or already closed ids are a no-op.
    pub fn close(&self, id: &str) -> Result<()> {
        if let Some(session) = self.session(id) {
            self.retire(&session, "closed by client");
        }
        Ok(())
    }

    /// Tear down every live session (process shutdown)
    pub fn close_all(&self) {
        let live: Vec<_> = match self.sessions.lock() {
            Ok(table) => table.values().cloned().collect(),
            Err(_) => return,
        };
        for session in live {
            self.retire(&session, "shutdown");
        }
    }

    /// A session leaves the table only once its shell is gone.
    fn retire(&self, session: &TerminalSession, reason: &str) {
        session.teardown(reason);
        session.join_reader();
        if session.state() != SessionState::Closed {
            // a concurrent teardown owns removal
            return;
        }
        if let Ok(mut table) = self.sessions.lock() {
            table.remove(session.id());
        }
    }

    pub fn live_count(&self) -> usize {
        self.table().map(|table| table.len()).unwrap_or(0)
    }
}

impl Drop for TerminalManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Per-session output pump
struct ReaderLoop {
    session: Arc<TerminalSession>,
    master: File,
    sink: Arc<dyn EventSink>,
    table: Weak<SessionTable>,
    poll_interval: Duration,
    chunk: usize,
}

impl ReaderLoop {
    fn run(mut self) {
        let fd = self.master.as_raw_fd();
        let mut buf = vec![0u8; self.chunk];
        let mut carry = Utf8Carry::default();

        while self.session.is_running() {
            match wait_readable(fd, self.poll_interval) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    log::debug!("poll on session {} failed: {}", self.session.id(), e);
                    break;
                }
            }

            match self.master.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let text = carry.push(&buf[..n]);
                    self.session.touch();
                    if !text.is_empty() && self.sink.emit(TerminalEvent::output(text)).is_err() {
                        log::debug!("Client of session {} went away", self.session.id());
                        self.finish("client disconnected");
                        return;
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {}
                // EIO once the slave side is fully closed
                Err(_) => break,
            }
        }

        if self.session.state() == SessionState::Running {
            let rest = carry.finish();
            if !rest.is_empty() {
                let _ = self.sink.emit(TerminalEvent::output(rest));
            }
            let _ = self.sink.emit(TerminalEvent::error(SESSION_ENDED));
            self.finish("shell exited");
        }
    }

    fn finish(&self, reason: &str) {
        if self.session.teardown(reason) {
            if let Some(table) = self.table.upgrade() {
                if let Ok(mut table) = table.lock() {
                    table.remove(self.session.id());
                }
            }
        }
    }
}
