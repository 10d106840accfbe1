//! One interactive shell behind a pseudo-terminal.
//!
//! State moves strictly forward: `Init → Running → Closing → Closed`. The
//! transition into `Closing` is a single compare-and-swap, so exactly one
//! caller performs teardown no matter how many race for it (explicit close,
//! shell exit seen by the reader, shutdown).

use crate::config::types::{LabError, Result};
use crate::kernel::pty::set_window_size;
use crate::observability::audit::events;
use crate::principal::Principal;
use crate::utils::process::wait_exited;
use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::process::Child;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

/// Upper bound on reaping after SIGKILL
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    Running,
    Closing,
    Closed,
}

impl SessionState {
    fn as_u8(self) -> u8 {
        match self {
            SessionState::Init => 0,
            SessionState::Running => 1,
            SessionState::Closing => 2,
            SessionState::Closed => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionState::Init,
            1 => SessionState::Running,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

struct SessionIo {
    master: Option<File>,
    child: Option<Child>,
}

/// A live shell session
pub struct TerminalSession {
    id: String,
    principal: Principal,
    pid: u32,
    state: AtomicU8,
    io: Mutex<SessionIo>,
    reader: Mutex<Option<JoinHandle<()>>>,
    last_activity: Mutex<DateTime<Utc>>,
    kill_grace: Duration,
}

impl TerminalSession {
    pub fn new(
        id: String,
        principal: Principal,
        child: Child,
        master: File,
        kill_grace: Duration,
    ) -> Self {
        Self {
            id,
            principal,
            pid: child.id(),
            state: AtomicU8::new(SessionState::Init.as_u8()),
            io: Mutex::new(SessionIo {
                master: Some(master),
                child: Some(child),
            }),
            reader: Mutex::new(None),
            last_activity: Mutex::new(Utc::now()),
            kill_grace,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
            .lock()
            .map(|at| *at)
            .unwrap_or_else(|_| Utc::now())
    }

    pub(crate) fn touch(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Utc::now();
        }
    }

    pub(crate) fn mark_running(&self) -> bool {
        self.transition(SessionState::Init, SessionState::Running)
    }

    pub(crate) fn set_reader(&self, handle: JoinHandle<()>) {
        if let Ok(mut reader) = self.reader.lock() {
            *reader = Some(handle);
        }
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn lock_io(&self) -> Result<std::sync::MutexGuard<'_, SessionIo>> {
        self.io
            .lock()
            .map_err(|_| LabError::SessionExpired(format!("session {} io lock poisoned", self.id)))
    }

    /// Forward raw bytes to the shell. Dropped silently unless running.
    pub fn write_input(&self, data: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        // Write through a duplicate so a full pty cannot hold the io lock
        // against teardown.
        let mut master = {
            let io = self.lock_io()?;
            match io.master.as_ref() {
                Some(master) => master.try_clone()?,
                None => return Ok(()),
            }
        };
        if let Err(e) = master.write_all(data).and_then(|_| master.flush()) {
            if self.is_running() {
                return Err(e.into());
            }
            log::debug!("Input to closed session {} dropped: {}", self.id, e);
            return Ok(());
        }
        self.touch();
        Ok(())
    }

    /// Forward a window size change to the line discipline
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        let io = self.lock_io()?;
        if let Some(master) = io.master.as_ref() {
            set_window_size(master, rows, cols)?;
        }
        Ok(())
    }

    /// Tear the session down. Returns false if another caller already did.
    ///
    /// SIGHUP to the shell's process group, close the master, give the group
    /// `kill_grace` to exit, SIGKILL whatever remains, then reap with a
    /// bounded wait.
    pub fn teardown(&self, reason: &str) -> bool {
        let claimed = self.transition(SessionState::Running, SessionState::Closing)
            || self.transition(SessionState::Init, SessionState::Closing);
        if !claimed {
            return false;
        }

        let group = Pid::from_raw(self.pid as i32);
        if let Err(e) = killpg(group, Signal::SIGHUP) {
            log::debug!("SIGHUP to group {} failed: {}", self.pid, e);
        }

        match self.io.lock() {
            Ok(mut io) => {
                io.master.take();
                if let Some(mut child) = io.child.take() {
                    self.reap(&mut child, group);
                }
            }
            Err(_) => {
                log::warn!("Session {} io lock poisoned during teardown", self.id);
                let _ = killpg(group, Signal::SIGKILL);
            }
        }

        self.state
            .store(SessionState::Closed.as_u8(), Ordering::SeqCst);
        events::session_closed(&self.id, &self.principal.name, reason);
        log::info!("Terminal session {} closed ({})", self.id, reason);
        true
    }

    fn reap(&self, child: &mut Child, group: Pid) {
        // The leader is observed but not reaped, so the group id stays ours
        // while stragglers are killed.
        if !matches!(wait_exited(group, self.kill_grace), Ok(true)) {
            let _ = killpg(group, Signal::SIGKILL);
            if !matches!(wait_exited(group, REAP_TIMEOUT), Ok(true)) {
                log::warn!(
                    "Shell {} of session {} did not exit after SIGKILL",
                    self.pid,
                    self.id
                );
                return;
            }
        }
        let _ = killpg(group, Signal::SIGKILL);
        let _ = child.wait();
    }

    /// Join the reader thread unless called from it
    pub(crate) fn join_reader(&self) {
        let handle = match self.reader.lock() {
            Ok(mut reader) => reader.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::warn!("Reader thread of session {} panicked", self.id);
            }
        }
    }
}

/// Incremental UTF-8 decoder for pty chunks.
///
/// Sequences split across reads are carried to the next chunk; invalid bytes
/// become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Flush a trailing incomplete sequence
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}
