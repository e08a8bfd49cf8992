use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tfrelay_core::exec::CommandRunner;
use tfrelay_core::workflow::{self, PlanVars, Terraform, Workflow};

use crate::config::RelayConfig;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    detail: String,
}

impl AppError {
    pub fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.into(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            detail: rejection.body_text(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "detail": self.detail });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State and response types
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    terraform: Arc<Terraform>,
    runner: Arc<dyn CommandRunner>,
}

impl AppState {
    pub fn new(terraform: Terraform, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            terraform: Arc::new(terraform),
            runner,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/terraform/setup-s3-backend/", post(setup_s3_backend))
        .route("/terraform/init/", post(init))
        .route("/terraform/plan/", post(plan))
        .route("/terraform/apply/", post(apply))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(config: &RelayConfig) -> Result<()> {
    let state = AppState::new(config.terraform(), Arc::new(config.runner()));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind((config.bind.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.bind, config.port))?;
    let addr = listener.local_addr()?;
    tracing::info!(
        terraform_dir = %config.terraform_dir.display(),
        "tfrelay serve listening on http://{addr}"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("tfrelay serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to install Ctrl+C handler; serving until killed");
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn setup_s3_backend(
    State(state): State<AppState>,
) -> Result<Json<MessageResponse>, AppError> {
    run_workflow(state, Workflow::SetupS3Backend).await
}

async fn init(State(state): State<AppState>) -> Result<Json<MessageResponse>, AppError> {
    run_workflow(state, Workflow::Init).await
}

async fn plan(
    State(state): State<AppState>,
    body: Result<Json<PlanVars>, JsonRejection>,
) -> Result<Json<MessageResponse>, AppError> {
    let Json(vars) = body?;
    run_workflow(state, Workflow::Plan(vars)).await
}

async fn apply(State(state): State<AppState>) -> Result<Json<MessageResponse>, AppError> {
    run_workflow(state, Workflow::Apply).await
}

/// Run `workflow` on its own task so a client that disconnects mid-request
/// does not abandon terraform between steps.
async fn run_workflow(
    state: AppState,
    workflow: Workflow,
) -> Result<Json<MessageResponse>, AppError> {
    let message = workflow.success_message();
    let prefix = workflow.failure_prefix();

    let task = tokio::spawn(async move {
        workflow::execute(&state.terraform, state.runner.as_ref(), &workflow)
            .await
            .map_err(|e| workflow.failure_detail(&e))
    });

    match task.await {
        Ok(Ok(())) => Ok(Json(MessageResponse { message })),
        Ok(Err(detail)) => Err(AppError::internal(detail)),
        Err(e) => Err(AppError::internal(format!("{prefix}: {e}"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
