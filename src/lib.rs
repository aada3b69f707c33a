//! Orchestrates the SMTP ingestion daemon's startup and component lifecycle.
//!
//! This library crate loads configuration, installs the hot-swappable
//! logger, and runs the [`daemon::Daemon`] (one accept loop per configured
//! listener, a shared backend gateway, and the hot-reconfiguration event
//! bus) alongside the ambient health-check surface. It mirrors the
//! teacher's `lib::run` shape — spawn the long-running pieces, `select!`
//! on whichever finishes first, treat a clean exit from either as fatal —
//! generalized from exactly two hardcoded tasks to the daemon's own
//! variable set of listeners plus the health server.

pub mod backend;
pub mod config;
pub mod daemon;
pub mod events;
pub mod health;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod smtp;
pub mod tls;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};

use config::AppConfig;
use daemon::Daemon;
use logging::{parse_level, DaemonLogger, Sink};

/// Installs the process-global logger from `config.log_file`/`log_level`
/// (§4.J "construct logger"), the first step of daemon start-up.
pub fn install_logger(config: &AppConfig) -> Result<&'static DaemonLogger> {
    let sink = Sink::from_config_value(&config.log_file);
    let level = parse_level(&config.log_level);
    DaemonLogger::new(sink, level)
        .context("failed to open configured log sink")?
        .install()
        .context("failed to install logger")
}

/// Runs the daemon until its health server exits or an interrupt arrives,
/// which — for a long-running service — is always an unexpected
/// termination worth surfacing as an error (mirrors the teacher's
/// `lib::run`: "a server task exiting without error is unexpected").
///
/// `health_bind_address` is the ambient `/health` surface's own listen
/// address, independent of the SMTP listeners in `config.servers`.
pub async fn run(config: AppConfig, logger: &'static DaemonLogger, health_bind_address: &str) -> Result<()> {
    info!(
        "starting {} v{} inbound-SMTP daemon",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let daemon = Daemon::start(config, logger)
        .await
        .context("failed to start daemon")?;

    let health_daemon = Arc::clone(&daemon);
    let health_bind_address = health_bind_address.to_string();
    let health_handle = tokio::spawn(async move {
        health::run_health_server(&health_bind_address, health_daemon).await
    });

    let result = tokio::select! {
        res = health_handle => {
            error!("health check server task terminated");
            match res {
                Ok(Ok(())) => Err(anyhow::anyhow!("health check server exited cleanly, which is unexpected")),
                Ok(Err(e)) => Err(e),
                Err(join_error) => Err(anyhow::anyhow!("health check server task failed: {join_error}")),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
            Ok(())
        }
    };

    daemon.shutdown().await;
    result
}
