use anyhow::Context;
use redis::aio::ConnectionManager;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use streamgate::auth::AuthManager;
use streamgate::cache::CacheClient;
use streamgate::config::{AppConfig, LogSettings};
use streamgate::db::{self, DbConfig, SqlAuthStore};
use streamgate::hooks::{AppState, HealthProbes, HookController, HookServer, HookUseCase};
use streamgate::models::NodeConfig;
use streamgate::repository::{AuthRepository, RedisStreamState, StreamStateStore};
use streamgate::scheduler::StreamTaskScheduler;
use streamgate::workers::WorkerPool;

const WORKER_QUEUE_CAPACITY: usize = 1000;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing(log: &LogSettings) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log.level.to_lowercase()));

    if log.to_file {
        let path = Path::new(&log.file_path);
        let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "streamgate.log".to_string());

        let appender = tracing_appender::rolling::never(
            directory.unwrap_or_else(|| Path::new(".")),
            file_name,
        );
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/config.ini".to_string());
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;

    let _log_guard = init_tracing(&config.log);
    info!(config = %config_path, "starting StreamGate");

    let nodes = match &config.nodes_file {
        Some(path) => Arc::new(
            NodeConfig::from_json_file(path)
                .with_context(|| format!("failed to load nodes file {path}"))?,
        ),
        None => {
            info!("no NODES_FILE configured, node selection falls back to loopback");
            Arc::new(NodeConfig::default())
        }
    };

    // Redis must answer PING before we accept any hook.
    let redis_client = redis::Client::open(config.redis.url())
        .context("invalid Redis connection settings")?;
    let redis_conn = ConnectionManager::new(redis_client)
        .await
        .context("failed to connect to Redis")?;
    let cache = CacheClient::new(redis_conn, config.cache_ttl_seconds);
    if !cache.ping().await {
        anyhow::bail!("Redis did not answer PING on startup");
    }
    info!(
        pool_size = config.redis.pool_size,
        "Redis connection established (multiplexed)"
    );

    let pool = db::create_pool(DbConfig::from(&config.db))
        .await
        .context("failed to open the SQL pool")?;

    let repository = Arc::new(AuthRepository::new(
        Arc::new(cache.clone()),
        Arc::new(SqlAuthStore::new(pool.clone())),
        config.cache_ttl_seconds,
    ));
    let worker_pool = Arc::new(WorkerPool::new(
        config.auth.thread_pool_size,
        WORKER_QUEUE_CAPACITY,
    ));
    let auth_manager = Arc::new(AuthManager::new(
        repository,
        worker_pool.clone(),
        config.auth.timeout,
    ));

    let state_store: Arc<dyn StreamStateStore> =
        Arc::new(RedisStreamState::new(cache.clone()));
    let scheduler = Arc::new(StreamTaskScheduler::new(
        auth_manager,
        state_store.clone(),
        nodes,
        config.scheduler.clone(),
    ));
    scheduler.start();

    let controller = Arc::new(HookController::new(HookUseCase::new(scheduler.clone())));
    let app_state = AppState {
        controller,
        probes: Some(Arc::new(HealthProbes {
            cache: cache.clone(),
            db: pool.clone(),
            state: state_store,
        })),
    };

    let server = HookServer::new(config.server.clone(), app_state);
    let result = server.run().await;

    info!("hook server stopped, tearing down");
    scheduler.stop().await;
    worker_pool.stop_and_wait(DRAIN_TIMEOUT).await;
    pool.close().await;

    result.context("hook server failed")?;
    info!("shutdown complete");
    Ok(())
}
