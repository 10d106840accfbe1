//! Labs: definitions, parameters, network leases and the start flow.

pub mod definition;
pub mod lease;
pub mod orchestrator;
pub mod params;
pub mod provision;

pub use definition::{CheckpointRule, DecodeMethod, Expectation, LabDefinition};
pub use lease::{LeasePool, NetworkLease};
pub use orchestrator::{Orchestrator, OrchestratorOutcome};
pub use params::{SubstitutionEngine, TokenMap};
pub use provision::{LabProvisioner, LabStartReport};
