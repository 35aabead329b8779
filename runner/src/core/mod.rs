//! Deterministic, pure logic for the workflow controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod graph;
pub mod invariants;
pub mod router;
pub mod run_id;
pub mod schema;
pub mod state;
pub mod types;
