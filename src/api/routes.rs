//! HTTP route handlers.

use std::sync::Arc;

use axum::middleware;
use axum::{
    extract::{rejection::JsonRejection, Extension, State},
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::clock::SystemClock;
use crate::config::Config;
use crate::store::SqliteProgressStore;
use crate::task::{Dispatcher, Outcome, TaskError, TaskView};
use crate::telegram::{InitDataVerifier, TelegramClient};

use super::auth::{self, AuthUser};
use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Evaluates completion checks against the progress store
    pub dispatcher: Dispatcher,
}

/// Build the router: public health check plus the authenticated task routes.
pub fn app(state: Arc<AppState>) -> Router {
    let public_routes = Router::new().route("/api/health", get(health));

    let protected_routes = Router::new()
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/check", post(check_task))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(SqliteProgressStore::new(&config.database_path).await?);
    tracing::info!("Progress store opened at {}", config.database_path.display());

    let membership = Arc::new(TelegramClient::new(&config.telegram)?);
    let verifier = Arc::new(InitDataVerifier::new(
        config.telegram.bot_token.clone(),
        config.telegram.init_data_max_age,
    ));

    let dispatcher = Dispatcher::new(store, membership, verifier, Arc::new(SystemClock))
        .with_store_timeout(config.store_timeout)
        .with_serialized_evaluation(config.serialize_evaluations);

    let state = Arc::new(AppState {
        config: config.clone(),
        dispatcher,
    });

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for SIGTERM/SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        persistent_store: state.dispatcher.store().is_persistent(),
    })
}

/// Check a task for the caller and grant its reward when complete.
async fn check_task(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    body: Result<Json<CheckTaskRequest>, JsonRejection>,
) -> Result<Outcome, TaskError> {
    let Json(req) = body.map_err(|e| {
        tracing::debug!("Rejected check request: {}", e);
        TaskError::Validation("Invalid request".to_string())
    })?;

    state
        .dispatcher
        .evaluate(req.task_id, &user.id, &req.strategy_input())
        .await
        .map_err(|e| {
            tracing::warn!("Check of task {} for {} failed: {}", req.task_id, user.id, e);
            e
        })
}

/// List every task with the caller's progress.
async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<TaskView>>, TaskError> {
    Ok(Json(state.dispatcher.list_tasks(&user.id).await?))
}
