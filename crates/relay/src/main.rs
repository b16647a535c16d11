mod api;
mod auth;
mod config;
mod context;
mod cors;
mod db;
mod error;
mod metrics;
mod presence;
mod sync;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    api::AppState,
    auth::jwt::JwtAccessTokenService,
    config::{LogFormat, RelayConfig},
    context::{
        store::{ContextStore, MemoryContextStore, PostgresContextStore},
        ContextManager,
    },
    db::{
        migrations::run_migrations,
        pool::{create_pg_pool, PoolConfig},
    },
    error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope},
    metrics::RelayMetrics,
    presence::PresenceRegistry,
    sync::{
        postgres::PostgresDocumentStore, store::DocumentStore, MemoryDocumentStore, SyncEngine,
    },
};

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;
const SERVICE_NAME: &str = "voyage-relay";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("VOYAGE_RELAY_JWT_SECRET is not set; using the development secret");
    }

    metrics::set_global_metrics(Arc::new(RelayMetrics::default()));

    let jwt_service = Arc::new(
        JwtAccessTokenService::new(&config.jwt_secret).context("invalid relay JWT secret")?,
    );
    let (state, lock_store) = build_state(&config).await?;
    spawn_maintenance(state.contexts.clone(), lock_store, config.context_sweep_interval);

    let app = build_router(state, jwt_service, config.cors_origins.as_deref());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting relay server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")
}

fn init_tracing(config: &RelayConfig) {
    let filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Postgres-backed stores when a database URL is configured, in-memory ones
/// otherwise. The Postgres document store is also returned for lock eviction.
async fn build_state(
    config: &RelayConfig,
) -> anyhow::Result<(AppState, Option<Arc<PostgresDocumentStore>>)> {
    let (documents, contexts, lock_store): (
        Arc<dyn DocumentStore>,
        Arc<dyn ContextStore>,
        Option<Arc<PostgresDocumentStore>>,
    ) = match config.database_url.as_deref() {
        Some(database_url) => {
            let pool = create_pg_pool(database_url, PoolConfig::from_env())
                .await
                .context("failed to initialize relay PostgreSQL pool")?;
            run_migrations(&pool).await.context("failed to run relay migrations")?;
            info!("using PostgreSQL stores");

            let lock_store = Arc::new(PostgresDocumentStore::new(pool.clone()));
            let documents: Arc<dyn DocumentStore> = lock_store.clone();
            let contexts: Arc<dyn ContextStore> = Arc::new(PostgresContextStore::new(pool));
            (documents, contexts, Some(lock_store))
        }
        None => {
            warn!("VOYAGE_RELAY_DATABASE_URL is not set; itineraries and contexts live in memory");
            let documents: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::default());
            let contexts: Arc<dyn ContextStore> = Arc::new(MemoryContextStore::default());
            (documents, contexts, None)
        }
    };

    let state = AppState::new(
        SyncEngine::with_lock_ttl(documents, config.lock_ttl),
        ContextManager::new(contexts),
        PresenceRegistry::default(),
    );
    Ok((state, lock_store))
}

fn spawn_maintenance(
    contexts: ContextManager,
    lock_store: Option<Arc<PostgresDocumentStore>>,
    interval: std::time::Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.reset();
        loop {
            ticker.tick().await;
            if let Err(error) = contexts.cleanup_expired().await {
                error!(error = %error, "expired context sweep failed");
            }
            if let Some(store) = &lock_store {
                match store.evict_expired_locks().await {
                    Ok(0) => {}
                    Ok(evicted) => info!(evicted, "evicted expired itinerary locks"),
                    Err(error) => error!(error = %error, "expired lock eviction failed"),
                }
            }
        }
    });
}

fn build_router(
    state: AppState,
    jwt_service: Arc<JwtAccessTokenService>,
    cors_origins: Option<&str>,
) -> Router {
    apply_middleware(
        Router::new()
            .route("/health", get(health))
            .route("/metrics", get(metrics_exposition))
            .merge(ws::router(state.clone(), Arc::clone(&jwt_service)))
            .merge(api::build_router(state, jwt_service)),
    )
    .layer(cors::cors_layer(cors_origins))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn metrics_exposition() -> impl IntoResponse {
    ([("content-type", "text/plain; version=0.0.4")], metrics::render_global())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let status = response.status().as_u16();
    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, status, latency_ms);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
