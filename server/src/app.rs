//! Composition root: picks the backends, wires state, mounts routes and runs
//! the background workers next to the HTTP server.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use axum::{
    routing::{get, patch, post},
    Router,
};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    api,
    auth::{Authenticator, StoreAuthenticator},
    channels::{build_channel_registry, ChannelRegistry},
    config::{AppConfig, FanoutMode, StoreBackend},
    orchestrator::Orchestrator,
    queue::{
        sync::{run_reaper, run_sync_worker, JobStore, SyncRunner},
        worker::{spawn_consumers, InboundHandler, OutboundHandler, TopicHandler},
        EventQueue, MemoryQueue, PgQueue, OUTBOUND_TOPIC,
    },
    realtime::{bus, Fanout, Hub},
    store::{ChatStore, MemoryStore, PgStore},
};

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn ChatStore>,
    pub queue: Arc<dyn EventQueue>,
    pub jobs: Arc<dyn JobStore>,
    pub hub: Arc<Hub>,
    pub orchestrator: Arc<Orchestrator>,
    pub auth: Arc<dyn Authenticator>,
}

/// Storage behind the state. `pool` is set for the Postgres backend only.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn ChatStore>,
    pub queue: Arc<dyn EventQueue>,
    pub jobs: Arc<dyn JobStore>,
    pub pool: Option<PgPool>,
}

impl Backends {
    pub fn memory() -> Self {
        let queue = Arc::new(MemoryQueue::new());
        Self {
            store: Arc::new(MemoryStore::new()),
            queue: queue.clone(),
            jobs: queue,
            pool: None,
        }
    }

    pub async fn connect(config: &AppConfig) -> Result<Self> {
        match config.store_backend {
            StoreBackend::Memory => {
                warn!("using the in-memory store; nothing survives a restart");
                Ok(Self::memory())
            }
            StoreBackend::Postgres => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.database_max_connections)
                    .connect(&config.database_url)
                    .await
                    .context("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)")?;
                sqlx::migrate!("./migrations")
                    .run(&pool)
                    .await
                    .context("failed to run sqlx migrations")?;
                let queue = Arc::new(PgQueue::new(pool.clone()));
                Ok(Self {
                    store: Arc::new(PgStore::new(pool.clone())),
                    queue: queue.clone(),
                    jobs: queue,
                    pool: Some(pool),
                })
            }
        }
    }
}

pub fn build_state(
    config: AppConfig,
    backends: &Backends,
    registry: ChannelRegistry,
) -> Result<Arc<AppState>> {
    let fanout = match (config.fanout, backends.pool.clone()) {
        (FanoutMode::Local, _) => Fanout::Local,
        (FanoutMode::Postgres, Some(pool)) => Fanout::Postgres(pool),
        (FanoutMode::Postgres, None) => bail!("postgres fan-out needs the postgres backend"),
    };
    let hub = Arc::new(Hub::new(
        config.dedup_capacity,
        config.single_socket_per_user,
        fanout,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        backends.store.clone(),
        registry,
        hub.clone(),
        backends.queue.clone(),
        config.upstream_timeout,
    ));
    Ok(Arc::new(AppState {
        auth: Arc::new(StoreAuthenticator::new(backends.store.clone())),
        store: backends.store.clone(),
        queue: backends.queue.clone(),
        jobs: backends.jobs.clone(),
        hub,
        orchestrator,
        config,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route(
            "/{platform}/webhook/receive",
            get(api::verify_webhook_subscription).post(api::receive_webhook),
        )
        .route("/chat/sms", post(api::send_message))
        .route("/conversations", get(api::list_conversations))
        .route("/conversations/{conversation_id}/messages", get(api::list_messages))
        .route(
            "/conversations/{conversation_id}/members",
            get(api::list_members).post(api::add_members),
        )
        .route(
            "/conversations/{conversation_id}/members/{member_id}",
            axum::routing::delete(api::remove_member),
        )
        .route("/conversations/{conversation_id}/read", post(api::mark_read))
        .route("/conversations/{conversation_id}/bot", patch(api::toggle_bot))
        .route("/admin/dead-letters", get(api::list_dead_letters))
        .route(
            "/admin/dead-letters/{item_id}/requeue",
            post(api::requeue_dead_letter),
        )
        .route("/channels/{channel_id}/sync", post(api::start_sync))
        .route("/sync-jobs/{job_id}", get(api::get_sync_job))
        .route("/ws", get(api::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Topic consumers, sync workers, the reaper and, for Postgres fan-out, the
/// notification listener.
pub fn spawn_workers(
    state: &Arc<AppState>,
    backends: &Backends,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let inbound: Arc<dyn TopicHandler> = Arc::new(InboundHandler::new(state.orchestrator.clone()));
    let mut handlers = state
        .config
        .enabled_platforms
        .iter()
        .map(|platform| (platform.inbound_topic(), inbound.clone()))
        .collect::<Vec<_>>();
    handlers.push((
        OUTBOUND_TOPIC.to_string(),
        Arc::new(OutboundHandler::new(state.orchestrator.clone())),
    ));
    let mut tasks = spawn_consumers(
        state.queue.clone(),
        handlers,
        &state.config.queue,
        shutdown.clone(),
    );

    let runner = Arc::new(SyncRunner::new(
        state.jobs.clone(),
        state.store.clone(),
        state.orchestrator.clone(),
        state.config.sync.page_limit,
    ));
    for index in 0..state.config.sync.workers {
        tasks.push(tokio::spawn(run_sync_worker(
            runner.clone(),
            format!("sync-{index}"),
            state.config.queue.poll_interval.max(Duration::from_secs(1)),
            shutdown.clone(),
        )));
    }
    tasks.push(tokio::spawn(run_reaper(
        state.jobs.clone(),
        state.config.sync.clone(),
        shutdown.clone(),
    )));

    if let (FanoutMode::Postgres, Some(pool)) = (state.config.fanout, backends.pool.clone()) {
        tasks.push(tokio::spawn(bus::listen(
            pool,
            state.hub.clone(),
            shutdown.clone(),
        )));
    }
    tasks
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }
    info!("shutdown requested");
    shutdown.cancel();
}

pub async fn run(config: AppConfig) -> Result<()> {
    let http = reqwest::Client::builder()
        .timeout(config.upstream_timeout)
        .build()
        .context("failed to build http client")?;
    let registry = build_channel_registry(&config, http)?;
    let backends = Backends::connect(&config).await?;
    let port = config.port;
    let state = build_state(config, &backends, registry)?;

    let shutdown = CancellationToken::new();
    let workers = spawn_workers(&state, &backends, &shutdown);
    let app = router(state.clone());

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        port,
        platforms = ?state.orchestrator.adapters().platforms(),
        "omnichat server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("server runtime failure")?;

    shutdown.cancel();
    for task in workers {
        if tokio::time::timeout(Duration::from_secs(10), task).await.is_err() {
            warn!("worker did not stop within 10s");
        }
    }
    info!("omnichat server stopped");
    Ok(())
}
