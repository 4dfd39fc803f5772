use crate::cache::{FetchOptions, RequestCoalescer};
use crate::cli::AgentArgs;
use crate::client::{ApiClient, CachedApi, HttpPresenceApi};
use crate::clock::SystemClock;
use crate::config::Config;
use crate::heartbeat::{HeartbeatConfig, HeartbeatDriver};
use crate::presence::{
    MemorySessionStore, NoBacklog, PgSessionStore, PresenceSnapshot, PresenceTracker,
    SessionStore, StartSessionRequest, SyncBacklog, UserDirectory,
};
use crate::state::AppState;
use crate::utils::fmt_duration;
use crate::web::create_router;
use anyhow::Context;
use sqlx::ConnectOptions;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cache key under which the agent keeps the presence listing.
const PRESENCE_KEY: &str = "presence/active";

/// The presence backend: storage, tracker and HTTP state.
pub struct App {
    config: Config,
    app_state: AppState,
}

impl App {
    /// Connect storage (Postgres when `DATABASE_URL` is set, memory otherwise)
    /// and build the shared state.
    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        let (sessions, users, backlog): (
            Arc<dyn SessionStore>,
            Arc<dyn UserDirectory>,
            Arc<dyn SyncBacklog>,
        ) = match &config.database_url {
            Some(url) => {
                let store = Arc::new(Self::connect_postgres(url).await?);
                (
                    store.clone() as Arc<dyn SessionStore>,
                    store.clone() as Arc<dyn UserDirectory>,
                    store as Arc<dyn SyncBacklog>,
                )
            }
            None => {
                warn!("DATABASE_URL not set, sessions are kept in memory and lost on restart");
                // No inbound feed exists without a database, so nothing is ever pending.
                let store = Arc::new(MemorySessionStore::new());
                (
                    store.clone() as Arc<dyn SessionStore>,
                    store as Arc<dyn UserDirectory>,
                    Arc::new(NoBacklog) as Arc<dyn SyncBacklog>,
                )
            }
        };

        let tracker = PresenceTracker::new(
            sessions,
            users,
            backlog,
            Arc::new(SystemClock),
            config.presence_thresholds(),
        );

        Ok(App {
            app_state: AppState::new(Arc::new(tracker)),
            config,
        })
    }

    async fn connect_postgres(url: &str) -> Result<PgSessionStore, anyhow::Error> {
        let connect_options = PgConnectOptions::from_str(url)
            .context("Failed to parse database URL")?
            .log_statements(tracing::log::LevelFilter::Debug)
            .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_secs(1));

        let pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(4))
            .idle_timeout(Duration::from_secs(60 * 2))
            .max_lifetime(Duration::from_secs(60 * 30))
            .connect_with(connect_options)
            .await
            .context("Failed to create database pool")?;
        info!(max_connections = 8, acquire_timeout = "4s", "database pool established");

        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        info!("Database migrations completed successfully");

        Ok(PgSessionStore::new(pool))
    }

    /// Serve HTTP until SIGINT/SIGTERM, then drain within `SHUTDOWN_TIMEOUT`.
    pub async fn run(self) -> ExitCode {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, %addr, "Failed to bind web server");
                return ExitCode::FAILURE;
            }
        };
        info!(%addr, "web server listening");

        let cancel = CancellationToken::new();
        let router = create_router(self.app_state);
        let server = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                axum::serve(
                    listener,
                    router.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
            })
        };

        shutdown_signal().await;
        info!(
            timeout = fmt_duration(self.config.shutdown_timeout),
            "Shutdown requested, draining connections"
        );
        cancel.cancel();

        match tokio::time::timeout(self.config.shutdown_timeout, server).await {
            Ok(Ok(Ok(()))) => {
                info!("web server stopped");
                ExitCode::SUCCESS
            }
            Ok(Ok(Err(e))) => {
                error!(error = %e, "web server failed");
                ExitCode::FAILURE
            }
            Ok(Err(e)) => {
                error!(error = %e, "web server task panicked");
                ExitCode::FAILURE
            }
            Err(_) => {
                warn!("Graceful shutdown timed out, exiting");
                ExitCode::FAILURE
            }
        }
    }
}

/// Keep this device's session alive until Ctrl-C, then end it.
pub async fn run_agent(config: &Config, args: AgentArgs) -> Result<(), anyhow::Error> {
    let api = ApiClient::new(config.api_base_url.clone(), config.cache_fetch_timeout)
        .context("Failed to build HTTP client")?;
    let cache = RequestCoalescer::new(config.coalescer());
    let cached = CachedApi::new(api.clone(), cache.clone(), config.cache_default_ttl);

    let cancel = CancellationToken::new();
    let maintenance =
        cache.spawn_maintenance(config.cache_lock_idle, config.cache_lock_idle, cancel.clone());

    let mut invalidate_on_sync = args.invalidate_on_sync;
    invalidate_on_sync.push(PRESENCE_KEY.to_owned());

    let driver = HeartbeatDriver::new(
        Arc::new(HttpPresenceApi::new(api)),
        StartSessionRequest {
            device_id: args.device_id,
            device_name: args.device_name,
            user_id: Some(args.user_id),
        },
        HeartbeatConfig {
            interval: config.heartbeat_interval,
            jitter: config.heartbeat_interval / 10,
            invalidate_on_sync,
        },
    )
    .with_cache(cache.clone());

    info!(base_url = %config.api_base_url, "agent starting");
    log_colleagues(&cached).await;

    let run = {
        let cancel = cancel.clone();
        async move { driver.run(cancel).await }
    };
    tokio::pin!(run);

    let finished = tokio::select! {
        _ = &mut run => true,
        _ = shutdown_signal() => false,
    };
    if !finished {
        info!("Shutdown requested, ending session");
        cancel.cancel();
        run.await;
    }

    cancel.cancel();
    if let Err(e) = maintenance.await {
        warn!(error = %e, "cache maintenance task failed");
    }
    info!(stats = ?cache.stats(), "agent stopped");
    Ok(())
}

async fn log_colleagues(cached: &CachedApi) {
    let lookup = cached
        .get_with::<Vec<PresenceSnapshot>>(
            PRESENCE_KEY,
            "/api/sessions/active",
            FetchOptions::ttl(Duration::from_secs(30)),
        )
        .await;
    match lookup.value() {
        Some(active) => info!(active = active.len(), "Users currently present"),
        None => warn!("Presence listing unavailable"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
