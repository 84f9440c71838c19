//! Worker agent library: protocol client, stager, runtimes, and the
//! agent loop. The binary in `main.rs` wires them from CLI flags.

pub mod agent;
pub mod client;
pub mod runtime;
pub mod stager;
