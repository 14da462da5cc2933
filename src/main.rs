use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use orgdeploy::gateway::{self, GatewayConfig};
use orgdeploy::worker::{ArchiveSource, CliTarget, Worker, WorkerConfig};
use orgdeploy::{
    JobQueue, MemoryQueue, MemorySessionStore, SessionStore, SqliteQueue, SqliteSessionStore, db,
};

const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "orgdeploy", version, about = "PKCE login gateway and deployment worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the login flow and the status API
    Gateway {
        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Run the deployment worker pool
    Worker {
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        content: ContentArgs,
    },
    /// Gateway and worker in one process, with in-memory stores
    Standalone {
        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        content: ContentArgs,
    },
}

#[derive(Args)]
struct ServerArgs {
    /// Listen address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    bind: SocketAddr,
}

#[derive(Args)]
struct StoreArgs {
    /// Shared session and job store
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:orgdeploy.db")]
    database_url: String,
}

#[derive(Args)]
struct TargetArgs {
    /// Command-line tool used to reach the target environment
    #[arg(long, env = "DEPLOY_CLI", default_value = "sf")]
    cli: String,

    /// `OAuth2` client identifier, reused for the CLI login
    #[arg(long, env = "OAUTH_CLIENT_ID")]
    client_id: String,
}

impl TargetArgs {
    fn target(&self) -> CliTarget {
        CliTarget::new(&self.cli, &self.client_id)
    }
}

#[derive(Args)]
struct ContentArgs {
    /// Archive URL; `{branch}` is replaced with the requested branch
    #[arg(long, env = "CONTENT_ARCHIVE_URL", default_value = ArchiveSource::DEFAULT_URL_TEMPLATE)]
    content_url: String,

    /// Name prefix of the single top-level directory inside the archive
    #[arg(long, env = "CONTENT_DIR_PREFIX", default_value = ArchiveSource::DEFAULT_DIR_PREFIX)]
    content_prefix: String,
}

impl ContentArgs {
    fn source(&self) -> ArchiveSource {
        ArchiveSource::new(&self.content_url, &self.content_prefix)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    match cli.command {
        Command::Gateway {
            server,
            store,
            target,
        } => {
            let pool = db::connect(&store.database_url)
                .await
                .context("opening store")?;
            let sessions = Arc::new(SqliteSessionStore::new(pool.clone()));
            let queue = Arc::new(SqliteQueue::new(pool));
            serve(&server, sessions, queue, target.target(), shutdown).await
        }
        Command::Worker {
            store,
            target,
            content,
        } => {
            let pool = db::connect(&store.database_url)
                .await
                .context("opening store")?;
            let queue = Arc::new(SqliteQueue::new(pool));
            run_worker(queue, target.target(), content.source(), shutdown).await
        }
        Command::Standalone {
            server,
            target,
            content,
        } => {
            let sessions = Arc::new(MemorySessionStore::new());
            let queue = Arc::new(MemoryQueue::new());
            let worker = tokio::spawn(run_worker(
                queue.clone(),
                target.target(),
                content.source(),
                shutdown.clone(),
            ));
            serve(&server, sessions, queue, target.target(), shutdown.clone()).await?;
            shutdown.cancel();
            worker.await.context("worker task panicked")?
        }
    }
}

fn init_tracing() {
    let verbose = matches!(
        std::env::var("LOG_VERBOSE").as_deref(),
        Ok("1") | Ok("true")
    );
    let default_filter = if verbose {
        "orgdeploy=debug,info"
    } else {
        "orgdeploy=info,warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve<S: SessionStore, Q: JobQueue>(
    args: &ServerArgs,
    sessions: Arc<S>,
    queue: Arc<Q>,
    target: CliTarget,
    shutdown: CancellationToken,
) -> Result<()> {
    let config = GatewayConfig::from_env().context("gateway configuration")?;
    let target = Arc::new(target);

    let preflight = config.preflight().clone();
    let probe_target = target.clone();
    tokio::spawn(async move { preflight.probe(&probe_target).await });

    tokio::spawn(gateway::purge_sessions(
        sessions.clone(),
        SESSION_PURGE_INTERVAL,
        shutdown.clone(),
    ));

    let app = gateway::gateway_routes(config, sessions, queue, target);
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    tracing::info!(addr = %args.bind, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("serving HTTP")?;
    tracing::info!("Gateway stopped");
    Ok(())
}

async fn run_worker<Q: JobQueue>(
    queue: Arc<Q>,
    target: CliTarget,
    content: ArchiveSource,
    shutdown: CancellationToken,
) -> Result<()> {
    let config = WorkerConfig::from_env().context("worker configuration")?;
    tracing::info!(
        cli = target.program(),
        concurrency = config.concurrency(),
        "Worker starting"
    );
    Worker::new(queue, Arc::new(target), Arc::new(content), config)
        .run(shutdown)
        .await?;
    tracing::info!("Worker stopped");
    Ok(())
}

/// Cancels `token` on Ctrl+C or SIGTERM.
async fn watch_signals(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("Shutdown signal received, draining");
    token.cancel();
}
