//! weft worker agent: joins a pool and executes leased tasks.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use weft_worker::agent::{Agent, AgentConfig};
use weft_worker::client::{ApiClient, ClientConfig};
use weft_worker::runtime::Runtime;
use weft_worker::stager::{Stager, StagerConfig, UploadMethod};

#[derive(Debug, Parser)]
#[command(name = "weft-worker", about = "Worker agent for the weft workflow engine")]
struct Args {
    /// Server base URL, e.g. http://localhost:8080
    #[arg(long, env = "WEFT_SERVER")]
    server: String,

    #[arg(long, env = "WEFT_WORKER_NAME", default_value = "worker")]
    name: String,

    /// Execution runtime: none, docker, or apptainer.
    #[arg(long, default_value = "none")]
    runtime: String,

    /// Worker group this agent serves.
    #[arg(long, env = "WEFT_WORKER_GROUP", default_value = "")]
    group: String,

    /// Shared registration key.
    #[arg(long, env = "WEFT_WORKER_KEY")]
    key: Option<String>,

    /// Long-poll window in seconds.
    #[arg(long, default_value_t = 20)]
    poll: u64,

    /// Lease TTL agreed with the server; heartbeats run at a third.
    #[arg(long, default_value_t = 90)]
    lease_ttl_secs: u64,

    #[arg(long, env = "WEFT_WORKDIR", default_value = "/var/tmp/weft-worker")]
    workdir: PathBuf,

    /// Per-task wall-clock limit in seconds; 0 disables.
    #[arg(long, default_value_t = 0)]
    task_timeout_secs: u64,

    #[arg(long, default_value_t = 60)]
    http_timeout_secs: u64,

    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    #[arg(long, default_value_t = 500)]
    retry_delay_ms: u64,

    /// Per-host credentials JSON for stage-in/out.
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Upload template with {taskID} and {filename}; outputs stay on
    /// the shared filesystem when unset.
    #[arg(long)]
    upload_path: Option<String>,

    /// put or post.
    #[arg(long, default_value = "put")]
    upload_method: String,

    /// Disable TLS verification (testing only).
    #[arg(long)]
    insecure_skip_verify: bool,

    /// Extra CA bundle (PEM).
    #[arg(long)]
    ca_bundle: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let runtime: Runtime = args.runtime.parse()?;
    let upload_method = match args.upload_method.as_str() {
        "put" => UploadMethod::Put,
        "post" => UploadMethod::Post,
        other => anyhow::bail!("unknown upload method {other:?}"),
    };

    let client = ApiClient::new(ClientConfig {
        base_url: args.server.clone(),
        timeout: Duration::from_secs(args.http_timeout_secs),
        max_retries: args.max_retries,
        retry_delay: Duration::from_millis(args.retry_delay_ms),
        insecure_skip_verify: args.insecure_skip_verify,
        ca_bundle: args.ca_bundle.clone(),
    })?;
    let stager = Stager::new(StagerConfig {
        http_timeout: Duration::from_secs(args.http_timeout_secs),
        max_retries: args.max_retries,
        retry_delay: Duration::from_millis(args.retry_delay_ms),
        credentials_path: args.credentials,
        upload_path: args.upload_path,
        upload_method,
        insecure_skip_verify: args.insecure_skip_verify,
        ca_bundle: args.ca_bundle,
    })?;

    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let config = AgentConfig {
        name: args.name,
        hostname,
        runtime,
        group: args.group,
        key: args.key,
        poll: Duration::from_secs(args.poll.max(1)),
        heartbeat: Duration::from_secs((args.lease_ttl_secs / 3).max(1)),
        workdir_base: args.workdir,
        task_timeout: (args.task_timeout_secs > 0)
            .then(|| Duration::from_secs(args.task_timeout_secs)),
    };

    let agent = Agent::new(client, stager, config);
    agent.run().await?;
    Ok(())
}
