//! A minimal health/readiness HTTP surface (§3 supplement), reporting
//! process liveness plus whether the backend gateway is shuttered and how
//! many listeners are currently active — ambient operability the teacher's
//! own `axum` `/health` endpoint already provides, generalized from a
//! bare 200-OK to reflect this daemon's actual runtime state.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use log::{error, info};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::daemon::Daemon;

#[derive(Clone)]
struct HealthState {
    daemon: Arc<Daemon>,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    active_listeners: usize,
    gateway_shuttered: bool,
}

async fn health_check_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let active_listeners = state.daemon.active_listener_count().await;
    let gateway_shuttered = state.daemon.gateway().is_shuttered();

    let status_code = if gateway_shuttered || active_listeners == 0 {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = HealthBody {
        status: if status_code == StatusCode::OK { "ok" } else { "degraded" },
        active_listeners,
        gateway_shuttered,
    };

    (status_code, Json(body))
}

/// Binds and serves the `/health` endpoint until cancelled. Runs as its own
/// task alongside the daemon's servers (§2.1 teacher parallel: `lib::run`'s
/// `select!` between the SMTP and health tasks).
pub async fn run_health_server(bind_address: &str, daemon: Arc<Daemon>) -> Result<()> {
    let state = HealthState { daemon };
    let app = Router::new()
        .route("/health", get(health_check_handler))
        .with_state(state);

    let listener = TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("failed to bind health check server to {bind_address}"))?;

    info!("health check server listening on {bind_address}");

    axum::serve(listener, app).await.map_err(|e| {
        error!("health check server error: {e}");
        anyhow::anyhow!("health check server failed: {e}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::logging::{DaemonLogger, Sink};

    async fn test_daemon() -> Arc<Daemon> {
        let logger = DaemonLogger::new(Sink::Stderr, log::LevelFilter::Off).unwrap();
        let logger: &'static DaemonLogger = Box::leak(Box::new(logger));
        let mut config = AppConfig::default();
        config.servers[0].listen_interface = "127.0.0.1:0".to_string();
        Daemon::start(config, logger).await.unwrap()
    }

    #[tokio::test]
    async fn reports_ok_with_active_listeners() {
        let daemon = test_daemon().await;
        let state = HealthState { daemon: Arc::clone(&daemon) };
        let response = health_check_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn reports_unavailable_once_gateway_is_shuttered() {
        let daemon = test_daemon().await;
        daemon.gateway().shuttered_for_shutdown();
        let state = HealthState { daemon: Arc::clone(&daemon) };
        let response = health_check_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        daemon.shutdown().await;
    }
}
