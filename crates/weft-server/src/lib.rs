//! API server for the weft workflow engine.
//!
//! Serves the worker protocol (register/lease/report/heartbeat) plus
//! workflow and submission intake, and hosts the scheduler loop.

pub mod envelope;
pub mod routes;
pub mod state;

pub use state::AppState;
