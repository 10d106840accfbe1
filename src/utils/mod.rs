//! Utilities
//!
//! Environment hygiene, bounded output collection and bounded process execution.

pub mod env_hygiene;
pub mod output;
pub mod process;
