//! labbox: per-student lab terminals, parameterized provisioning and grading
//!
//! Each student gets a dedicated OS principal, a private copy of the lab
//! template with per-student parameters, and an interactive shell streamed
//! over an event protocol. Submissions are graded against literal answers or
//! per-student daily flags.
//!
//! # Architecture
//!
//! ## Command Admission ([`admission`])
//! - [`admission::gate`]: allow-list, dangerous patterns, path scope
//! - [`admission::paths`]: lexical path resolution and containment
//! - [`admission::exec`]: bounded execution as the student's principal
//!
//! ## Labs ([`lab`])
//! - [`lab::definition`]: lab definitions, checkpoint rules, scoring
//! - [`lab::lease`]: network lease pool
//! - [`lab::params`]: parameter resolution and template rewriting
//! - [`lab::provision`]: the lab-start flow
//! - [`lab::orchestrator`]: external orchestration tooling
//!
//! ## Principals ([`principal`])
//! - [`principal::os_user`]: one OS account per student
//! - [`principal::shared`]: directory-only separation for development hosts
//! - [`principal::validation`]: uid/gid sanity checks
//!
//! ## Terminals ([`terminal`])
//! - [`terminal::manager`] and [`terminal::session`]: pty shells and their lifecycle
//! - [`terminal::console`]: line-buffered fallback console
//! - [`terminal::gateway`]: per-connection event routing
//! - [`terminal::events`]: wire events and sinks
//!
//! ## Grading ([`grading`])
//! - [`grading::decode`], [`grading::flag`], [`grading::score`]
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::pty`]: openpty, window size, controlling terminal
//! - [`kernel::signal`]: shutdown signalling
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: structured JSON-lines audit events
//!
//! ## Configuration ([`config`]) and Utilities ([`utils`])
//! - [`config::types`], [`config::loader`], [`config::validator`]
//! - [`utils::env_hygiene`], [`utils::output`], [`utils::process`]

pub mod admission;
pub mod config;
pub mod grading;
pub mod kernel;
pub mod lab;
pub mod observability;
pub mod principal;
pub mod terminal;
pub mod utils;

// CLI entrypoint wiring for the labbox binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
