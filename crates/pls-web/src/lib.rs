//! Axum JSON surface that dispatches collection jobs and reports their status.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pls_sync::{is_valid_survey_year, Collector};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "pls-web";

#[derive(Clone)]
pub struct AppState {
    pub collector: Arc<Collector>,
}

impl AppState {
    pub fn new(collector: Arc<Collector>) -> Self {
        Self { collector }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Accepted {
    pub status: &'static str,
    pub job: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
}

impl Accepted {
    fn job(job: &'static str, year: Option<i32>) -> Response {
        (
            StatusCode::ACCEPTED,
            Json(Self {
                status: "accepted",
                job,
                year,
            }),
        )
            .into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/collection/status", get(status_handler))
        .route("/collection/years/{year}", post(collect_year_handler))
        .route("/collection/all", post(collect_all_handler))
        .route("/collection/latest", post(update_latest_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(collector: Arc<Collector>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "collection api listening");
    axum::serve(listener, app(AppState::new(collector)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Builds the collector from the environment, starts the update scheduler when
/// enabled, and serves until interrupted. `port` overrides `PLS_WEB_PORT`.
pub async fn serve_from_env(port: Option<u16>) -> anyhow::Result<()> {
    let collector = pls_sync::collector_from_env().await?;
    let scheduler = collector.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }
    let port = port.unwrap_or(collector.config().web_port);
    serve(collector, port).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "listening for shutdown signal failed");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.collector.get_collection_status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => server_error(err),
    }
}

async fn collect_year_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(raw_year): AxumPath<String>,
) -> Response {
    let year = match raw_year.trim().parse::<i32>() {
        Ok(year) if is_valid_survey_year(year) => year,
        _ => return bad_request(format!("invalid survey year: {raw_year}")),
    };

    let collector = Arc::clone(&state.collector);
    tokio::spawn(async move {
        let ok = collector.collect_data_for_year(year).await;
        info!(year, ok, "background collection finished");
    });
    Accepted::job("collect_year", Some(year))
}

async fn collect_all_handler(State(state): State<Arc<AppState>>) -> Response {
    let collector = Arc::clone(&state.collector);
    tokio::spawn(async move {
        let results = collector.collect_all_available_data().await;
        let succeeded = results.values().filter(|ok| **ok).count();
        info!(years = results.len(), succeeded, "background collection of all years finished");
    });
    Accepted::job("collect_all", None)
}

async fn update_latest_handler(State(state): State<Arc<AppState>>) -> Response {
    let collector = Arc::clone(&state.collector);
    tokio::spawn(async move {
        let outcome = collector.update_with_latest_data().await;
        info!(?outcome, "background update finished");
    });
    Accepted::job("update_latest", None)
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}
