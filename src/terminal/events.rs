//! Transport events and sinks.
//!
//! Both directions serialize as `{"event": <name>, "data": {...}}`.

use crate::config::types::{LabError, Result};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Mutex;

/// Server → client
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum TerminalEvent {
    TerminalOutput { data: String },
    TerminalError { error: String },
    TerminalReady { status: String },
    TerminalClear {},
}

impl TerminalEvent {
    pub fn output(data: impl Into<String>) -> Self {
        TerminalEvent::TerminalOutput { data: data.into() }
    }

    pub fn error(error: impl Into<String>) -> Self {
        TerminalEvent::TerminalError {
            error: error.into(),
        }
    }

    pub fn ready() -> Self {
        TerminalEvent::TerminalReady {
            status: "ready".to_string(),
        }
    }
}

/// Client → server
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    StartTerminal { lab_session_id: String },
    TerminalInput { data: String },
    TerminalResize { rows: u16, cols: u16 },
    Disconnect,
}

/// Outbound half of one connection
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TerminalEvent) -> Result<()>;
}

impl EventSink for Sender<TerminalEvent> {
    fn emit(&self, event: TerminalEvent) -> Result<()> {
        self.send(event)
            .map_err(|_| LabError::SessionExpired("event receiver disconnected".to_string()))
    }
}

/// Writes one JSON object per line
pub struct JsonLineSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLineSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> Option<W> {
        self.writer.into_inner().ok()
    }
}

impl<W: Write + Send> EventSink for JsonLineSink<W> {
    fn emit(&self, event: TerminalEvent) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| LabError::SessionExpired("event writer lock poisoned".to_string()))?;
        serde_json::to_writer(&mut *writer, &event)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}
