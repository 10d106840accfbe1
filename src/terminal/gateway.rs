//! Per-connection event routing.
//!
//! A [`Connection`] owns at most one terminal at a time. `start_terminal`
//! resolves the lab session, materializes the student's principal and opens
//! either a pty shell or a fallback console depending on the configured mode.

use super::console::{welcome_banner, ConsoleSession};
use super::events::{ClientEvent, EventSink, TerminalEvent};
use super::manager::TerminalManager;
use crate::admission::AdmissionController;
use crate::config::types::{LabError, Result, TerminalMode};
use crate::lab::definition::LabDefinition;
use crate::principal::{Identity, Principal, PrincipalManager};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const LAB_SESSION_NOT_FOUND: &str = "Lab session not found";
pub const NO_ACTIVE_SESSION: &str = "No active terminal session";
const START_FAILED: &str = "Failed to start terminal";

/// A started lab the gateway can attach a terminal to
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LabSessionRecord {
    pub lab: LabDefinition,
    pub student_folder: PathBuf,
    pub email: String,
}

/// Lookup of started labs by id
pub trait LabSessionDirectory: Send + Sync {
    fn lookup(&self, lab_session_id: &str) -> Option<LabSessionRecord>;
}

#[derive(Default)]
pub struct InMemoryDirectory {
    records: Mutex<HashMap<String, LabSessionRecord>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `{ "<id>": { "lab": {...}, "student_folder": "...", "email": "..." } }`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            LabError::Config(format!("Failed to read lab sessions {}: {}", path.display(), e))
        })?;
        let records: HashMap<String, LabSessionRecord> = serde_json::from_str(&text)?;
        for record in records.values() {
            record.lab.validate()?;
        }
        Ok(Self {
            records: Mutex::new(records),
        })
    }

    pub fn insert(&self, id: impl Into<String>, record: LabSessionRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(id.into(), record);
        }
    }
}

impl LabSessionDirectory for InMemoryDirectory {
    fn lookup(&self, lab_session_id: &str) -> Option<LabSessionRecord> {
        self.records
            .lock()
            .ok()
            .and_then(|records| records.get(lab_session_id).cloned())
    }
}

/// Shared services every connection routes into
#[derive(Clone)]
pub struct Gateway {
    pub mode: TerminalMode,
    pub terminals: Arc<TerminalManager>,
    pub admission: Arc<AdmissionController>,
    pub principals: Arc<PrincipalManager>,
    pub directory: Arc<dyn LabSessionDirectory>,
}

impl Gateway {
    pub fn connect(&self, sink: Arc<dyn EventSink>) -> Connection {
        Connection {
            gateway: self.clone(),
            sink,
            active: None,
        }
    }
}

enum ActiveTerminal {
    Pty(String),
    Console(Box<ConsoleSession>),
}

/// One client connection
pub struct Connection {
    gateway: Gateway,
    sink: Arc<dyn EventSink>,
    active: Option<ActiveTerminal>,
}

impl Connection {
    pub fn handle(&mut self, event: ClientEvent) -> Result<()> {
        match event {
            ClientEvent::StartTerminal { lab_session_id } => self.start_terminal(&lab_session_id),
            ClientEvent::TerminalInput { data } => self.input(&data),
            ClientEvent::TerminalResize { rows, cols } => self.resize(rows, cols),
            ClientEvent::Disconnect => {
                self.disconnect();
                Ok(())
            }
        }
    }

    pub fn has_terminal(&self) -> bool {
        self.active.is_some()
    }

    fn start_terminal(&mut self, lab_session_id: &str) -> Result<()> {
        let Some(record) = self.gateway.directory.lookup(lab_session_id) else {
            self.sink.emit(TerminalEvent::error(LAB_SESSION_NOT_FOUND))?;
            return Ok(());
        };

        self.disconnect();

        let principal = match self.principal_for(&record) {
            Ok(principal) => principal,
            Err(e) => {
                log::error!("Principal for lab session {} unavailable: {}", lab_session_id, e);
                self.sink.emit(TerminalEvent::error(START_FAILED))?;
                return Err(e);
            }
        };

        let working_dir = if record.student_folder.is_dir() {
            record.student_folder.clone()
        } else {
            log::warn!(
                "Student folder {} missing, starting in {}",
                record.student_folder.display(),
                principal.home.display()
            );
            principal.home.clone()
        };
        let banner = welcome_banner(&record.lab.name, &working_dir);

        match self.gateway.mode {
            TerminalMode::Pty => {
                // The banner must precede any shell output.
                self.sink.emit(TerminalEvent::output(banner))?;
                let id = match self
                    .gateway
                    .terminals
                    .open(&principal, &working_dir, self.sink.clone())
                {
                    Ok(id) => id,
                    Err(e) => {
                        log::error!("Failed to open pty for {}: {}", principal.name, e);
                        self.sink.emit(TerminalEvent::error(START_FAILED))?;
                        return Err(e);
                    }
                };
                self.active = Some(ActiveTerminal::Pty(id));
            }
            TerminalMode::Fallback => {
                let console = ConsoleSession::new(
                    Uuid::new_v4().to_string(),
                    principal,
                    working_dir,
                    record.lab.accessible_resources.clone(),
                    self.gateway.admission.clone(),
                    self.sink.clone(),
                );
                let greeting = format!("{}{}", banner, console.prompt());
                self.active = Some(ActiveTerminal::Console(Box::new(console)));
                self.sink.emit(TerminalEvent::output(greeting))?;
            }
        }

        self.sink.emit(TerminalEvent::ready())
    }

    fn principal_for(&self, record: &LabSessionRecord) -> Result<Principal> {
        let identity = Identity::new(record.email.clone())?;
        self.gateway.principals.ensure(&identity)
    }

    fn input(&mut self, data: &str) -> Result<()> {
        let result = match self.active.as_mut() {
            None => {
                self.sink.emit(TerminalEvent::error(NO_ACTIVE_SESSION))?;
                return Ok(());
            }
            Some(ActiveTerminal::Console(console)) => return console.handle_input(data),
            Some(ActiveTerminal::Pty(id)) => self.gateway.terminals.write_input(id, data.as_bytes()),
        };

        match result {
            Err(LabError::SessionExpired(_)) => {
                self.active = None;
                self.sink.emit(TerminalEvent::error(NO_ACTIVE_SESSION))
            }
            other => other,
        }
    }

    fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        let result = match self.active.as_ref() {
            Some(ActiveTerminal::Pty(id)) => self.gateway.terminals.resize(id, rows, cols),
            _ => return Ok(()),
        };
        match result {
            Err(LabError::SessionExpired(_)) => {
                self.active = None;
                Ok(())
            }
            other => other,
        }
    }

    /// Close whatever terminal this connection owns
    pub fn disconnect(&mut self) {
        if let Some(ActiveTerminal::Pty(id)) = self.active.take() {
            if let Err(e) = self.gateway.terminals.close(&id) {
                log::warn!("Closing session {} failed: {}", id, e);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
