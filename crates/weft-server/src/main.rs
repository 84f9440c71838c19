//! weft API server: store, scheduler, and worker protocol in one binary.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::Store;
use weft_executor::{
    DockerExecutor, ExecutorRegistry, LocalExecutor, RpcConfig, RpcExecutor, WorkerExecutor,
};
use weft_scheduler::{Scheduler, SchedulerConfig};
use weft_server::{routes, AppState};
use weft_staging::PropertyEvaluator;
use weft_store::{create_pool, run_migrations, SqliteStore};

#[derive(Debug, Parser)]
#[command(name = "weft-server", about = "CWL workflow engine server")]
struct Args {
    #[arg(long, env = "WEFT_DATABASE_URL", default_value = "sqlite:weft.db?mode=rwc")]
    database_url: String,

    #[arg(long, env = "WEFT_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Root for task work directories and preserved outputs.
    #[arg(long, env = "WEFT_DATA_DIR", default_value = "/var/tmp/weft")]
    data_dir: PathBuf,

    /// Shared secret worker agents must present at registration.
    #[arg(long, env = "WEFT_WORKER_KEY")]
    worker_key: Option<String>,

    #[arg(long, default_value_t = 1)]
    tick_secs: u64,

    #[arg(long, default_value_t = 90)]
    lease_ttl_secs: u64,

    /// Upper bound on worker lease long-polling.
    #[arg(long, default_value_t = 25)]
    poll_window_secs: u64,

    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    #[arg(long, default_value_t = 4)]
    max_parallel: usize,

    /// Per-task wall-clock limit in seconds; 0 disables.
    #[arg(long, default_value_t = 0)]
    task_timeout_secs: u64,

    /// Register the Docker executor (requires a reachable daemon).
    #[arg(long)]
    enable_docker: bool,

    /// Register the remote application-service executor.
    #[arg(long, env = "WEFT_APP_SERVICE_URL")]
    app_service_url: Option<String>,

    /// Executor used when a task carries no hint.
    #[arg(long)]
    default_executor: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!(database_url = %args.database_url, "connecting to store");
    let pool = create_pool(&args.database_url).await?;
    run_migrations(&pool).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));

    let workdir_base = args.data_dir.join("work");
    let outputs_base = args.data_dir.join("outputs");
    let evaluator = Arc::new(PropertyEvaluator);

    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(LocalExecutor::new(
        workdir_base.clone(),
        outputs_base.clone(),
        evaluator.clone(),
    )));
    registry.register(Arc::new(WorkerExecutor::new(store.clone())));
    if args.enable_docker {
        match DockerExecutor::new(workdir_base, outputs_base, evaluator) {
            Ok(executor) => registry.register(Arc::new(executor)),
            Err(e) => warn!(error = %e, "docker executor unavailable"),
        }
    }
    if let Some(url) = &args.app_service_url {
        let config = RpcConfig {
            url: url.clone(),
            ..Default::default()
        };
        registry.register(Arc::new(RpcExecutor::new(config)?));
    }
    let registry = match &args.default_executor {
        Some(name) => Arc::new(registry.with_default(name.clone())),
        None => Arc::new(registry),
    };

    let config = SchedulerConfig {
        tick_interval: Duration::from_secs(args.tick_secs.max(1)),
        max_attempts: args.max_attempts,
        max_parallel: args.max_parallel,
        task_timeout: (args.task_timeout_secs > 0)
            .then(|| Duration::from_secs(args.task_timeout_secs)),
        ..Default::default()
    };
    let scheduler = Scheduler::new(store.clone(), registry, config);
    let wake = scheduler.wake_handle();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    let state = AppState::new(store, wake)
        .with_worker_key(args.worker_key)
        .with_lease_ttl(Duration::from_secs(args.lease_ttl_secs))
        .with_poll_window(Duration::from_secs(args.poll_window_secs));

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!(listen = %args.listen, "starting server");
    let listener = TcpListener::bind(args.listen).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    });

    tokio::select! {
        result = server => {
            result?;
            let _ = shutdown_tx.send(true);
            let _ = scheduler_handle.await;
        }
        joined = &mut scheduler_handle => {
            // A scheduler panic must take the process down so an
            // orchestrator restarts it.
            match joined {
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                _ => anyhow::bail!("scheduler exited unexpectedly"),
            }
        }
    }
    Ok(())
}
