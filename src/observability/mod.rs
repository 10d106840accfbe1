//! Observability
//!
//! Structured audit events for admission, sessions, principals, provisioning and grading.

pub mod audit;
