//! Integration tests module
//!
//! End-to-end tests driving the orchestrator against the in-memory fleet:
//! - Complete discover → connect → prepare → capture → finalize → collect runs
//! - Per-device fault isolation and fleet exhaustion
//! - Identity assignment properties of the session registry

pub mod fault_isolation_test;
pub mod fixtures;
pub mod lifecycle_test;
pub mod registry_test;
