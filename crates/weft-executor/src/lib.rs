//! Task execution backends for the weft workflow engine.
//!
//! Provides executor implementations for running workflow tasks:
//! - Local child processes (development and host execution)
//! - Docker containers via bollard
//! - Distributed worker agents (claimed over HTTP)
//! - Remote application services over JSON-RPC 1.1

pub mod command;
pub mod docker;
pub mod local;
pub mod outputs;
pub mod registry;
pub mod rpc;
pub mod token;
pub mod worker;

pub use command::{build_command, BuiltCommand};
pub use docker::DockerExecutor;
pub use local::{run_process, LocalExecutor};
pub use outputs::{collect_outputs, file_metadata, preserve_outputs};
pub use registry::ExecutorRegistry;
pub use rpc::{RpcConfig, RpcExecutor};
pub use token::discover_token;
pub use worker::{WorkerExecutor, WORKER_EXECUTOR_NAME};
