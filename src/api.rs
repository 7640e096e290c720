use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use media_bus::{Pipeline, StageStatus};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct ApiState {
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
}

/// Serves the control API on `listen` until `cancel` fires.
pub(crate) async fn start_api_server(
    listen: String,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let state = ApiState {
        pipeline,
        cancel: cancel.clone(),
    };
    let app = Router::new()
        .route("/status", get(status))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/stop", post(stop))
        .with_state(state);

    let listener = TcpListener::bind(&listen).await?;
    log::info!("control API listening on {}", listen);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
        {
            log::error!("control API failed: {}", e);
        }
    });
    Ok(())
}

async fn status(State(state): State<ApiState>) -> Json<Vec<StageStatus>> {
    Json(state.pipeline.status())
}

fn set_paused(state: &ApiState, paused: bool) -> Result<StatusCode, (StatusCode, String)> {
    state
        .pipeline
        .pause(paused)
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(|e| (StatusCode::CONFLICT, e.to_string()))
}

async fn pause(State(state): State<ApiState>) -> Result<StatusCode, (StatusCode, String)> {
    set_paused(&state, true)
}

async fn resume(State(state): State<ApiState>) -> Result<StatusCode, (StatusCode, String)> {
    set_paused(&state, false)
}

async fn stop(State(state): State<ApiState>) -> StatusCode {
    state.cancel.cancel();
    StatusCode::ACCEPTED
}
