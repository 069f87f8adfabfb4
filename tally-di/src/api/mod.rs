//! HTTP API for the document-ingest service
//!
//! Operational control surface: submit documents, inspect units of work,
//! publish rule-sets, and trigger re-normalization sweeps. Reporting and
//! UI concerns live elsewhere; these endpoints only carry the pipeline's
//! operational signals.

pub mod health;
pub mod ingest;
pub mod observations;
pub mod rulesets;
pub mod sweeps;

pub use health::health_routes;
pub use ingest::ingest_routes;
pub use observations::observation_routes;
pub use rulesets::ruleset_routes;
pub use sweeps::sweep_routes;
