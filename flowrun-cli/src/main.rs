//! flowrun command line
//!
//! `serve` runs the pool manager in the foreground until interrupted. The
//! manager spawns workers by re-invoking this binary in its hidden `worker`
//! mode, so both halves of the system live in one executable.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use flowrun_config::{ConfigLoader, FlowrunConfig, LogFormat, LoggingConfig, StoreBackend};
use flowrun_ipc::{ContextStore, ExecutionResult, FsContextStore};
use flowrun_pool::{FsRegistry, InMemoryRegistry, PoolManager, PoolRegistry, ProcessSpawner, ResultSink};
use flowrun_worker::{worker_main, EchoEngine};

#[derive(Parser)]
#[command(name = "flowrun", version, about = "Workflow execution process pool")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pool manager until interrupted
    Serve,

    /// Route one execution through a temporary pool and print its result
    Run {
        /// Execution id; generated when omitted
        #[arg(long)]
        execution_id: Option<String>,

        /// JSON parameters handed to the workflow
        #[arg(long, default_value = "{}")]
        params: String,

        /// Per-execution timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Internal worker mode, spawned by the pool manager
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        worker_id: String,

        #[arg(long)]
        store_path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::new()
        .load(cli.config.as_ref())
        .context("failed to load configuration")?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Run {
            execution_id,
            params,
            timeout,
        } => run_once(config, execution_id, params, timeout).await,
        Commands::Worker {
            worker_id,
            store_path,
        } => worker(worker_id, store_path).await,
    }
}

/// Stdout belongs to the worker protocol, so all logs go to stderr in
/// every mode
fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.level.as_filter_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(config.include_location)
        .with_line_number(config.include_location);
    match config.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

fn build_store(config: &FlowrunConfig) -> Result<Arc<dyn ContextStore>> {
    match config.store.backend {
        StoreBackend::Filesystem => Ok(Arc::new(FsContextStore::new(&config.store.path))),
        // Workers are separate processes, so an in-process store can never
        // reach them
        StoreBackend::Memory => {
            bail!("the memory context store cannot be shared with worker processes; configure store.backend = filesystem")
        }
    }
}

fn build_registry(config: &FlowrunConfig) -> Arc<dyn PoolRegistry> {
    match config.registry.backend {
        StoreBackend::Filesystem => Arc::new(FsRegistry::new(&config.registry.path)),
        StoreBackend::Memory => Arc::new(InMemoryRegistry::new()),
    }
}

fn build_spawner(config: &FlowrunConfig) -> Result<ProcessSpawner> {
    Ok(ProcessSpawner::current_exe(vec![
        "worker".to_string(),
        "--store-path".to_string(),
        config.store.path.clone(),
    ])?)
}

/// Sink used in serve mode: terminal results are logged, nothing more
struct LoggingSink;

#[async_trait]
impl ResultSink for LoggingSink {
    async fn deliver(&self, result: ExecutionResult) {
        if result.success {
            info!(
                execution_id = %result.execution_id,
                worker_id = %result.worker_id,
                duration_ms = result.duration_ms,
                "execution completed"
            );
        } else {
            let reason = result
                .error
                .as_ref()
                .map(|e| format!("{}: {}", e.kind, e.message))
                .unwrap_or_else(|| "unknown".to_string());
            error!(
                execution_id = %result.execution_id,
                worker_id = %result.worker_id,
                duration_ms = result.duration_ms,
                error = %reason,
                "execution failed"
            );
        }
    }
}

/// Sink used by `run`: forwards the single expected result to the caller
struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<ExecutionResult>,
}

#[async_trait]
impl ResultSink for ChannelSink {
    async fn deliver(&self, result: ExecutionResult) {
        let _ = self.tx.send(result);
    }
}

async fn serve(config: FlowrunConfig) -> Result<()> {
    let store = build_store(&config)?;
    let registry = build_registry(&config);
    let spawner = build_spawner(&config)?;

    let pool_id = format!("flowrun-{}", uuid::Uuid::new_v4());
    let manager = PoolManager::new(
        pool_id,
        config.pool.clone(),
        store,
        registry,
        Arc::new(spawner),
        Arc::new(LoggingSink),
    )?;

    manager.start().await?;
    wait_for_shutdown().await;
    info!("shutdown signal received, draining pool");
    manager.stop().await?;
    Ok(())
}

async fn run_once(
    config: FlowrunConfig,
    execution_id: Option<String>,
    params: String,
    timeout: Option<u64>,
) -> Result<()> {
    let params: serde_json::Value =
        serde_json::from_str(&params).context("--params must be valid JSON")?;
    let execution_id = execution_id.unwrap_or_else(|| format!("exec-{}", uuid::Uuid::new_v4()));

    let store = build_store(&config)?;
    let registry = build_registry(&config);
    let spawner = build_spawner(&config)?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut pool_config = config.pool.clone();
    pool_config.min_workers = 1;
    pool_config.max_workers = pool_config.max_workers.max(1);

    let manager = PoolManager::new(
        format!("flowrun-run-{}", uuid::Uuid::new_v4()),
        pool_config,
        store,
        registry,
        Arc::new(spawner),
        Arc::new(ChannelSink { tx }),
    )?;
    manager.start().await?;

    let context = serde_json::json!({
        "params": params,
        "caller": "cli",
    });
    let outcome = async {
        manager
            .route_execution(&execution_id, context, timeout.map(Duration::from_secs))
            .await?;
        Ok::<_, anyhow::Error>(rx.recv().await)
    }
    .await;
    manager.stop().await?;

    let result = outcome?.context("pool stopped before a result arrived")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.success {
        Ok(())
    } else {
        bail!("execution {} failed", result.execution_id)
    }
}

async fn worker(worker_id: String, store_path: PathBuf) -> Result<()> {
    info!(worker_id = %worker_id, "worker process starting");
    let store = Arc::new(FsContextStore::new(store_path)) as Arc<dyn ContextStore>;
    worker_main(worker_id, Arc::new(EchoEngine), store).await?;
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
