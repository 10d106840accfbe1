//! Browser terminal sessions.
//!
//! Two backends sit behind the same event protocol: a real shell on a
//! pseudo-terminal ([`manager`]) and a line-buffered console whose commands
//! pass through admission ([`console`]). [`gateway`] routes client events to
//! whichever the deployment selected.

pub mod console;
pub mod events;
pub mod gateway;
pub mod manager;
pub mod session;

pub use events::{ClientEvent, EventSink, JsonLineSink, TerminalEvent};
pub use gateway::{Connection, Gateway, InMemoryDirectory, LabSessionDirectory, LabSessionRecord};
pub use manager::TerminalManager;
pub use session::{SessionState, TerminalSession};
