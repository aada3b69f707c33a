//! The orchestrator (§4.J): owns the configuration, logger, backend gateway
//! and the set of per-listener servers; entry points are `start`,
//! `shutdown`, `reload_config`, `reopen_logs`.
//!
//! Generalizes the teacher's `lib::run` (spawn exactly one SMTP server and
//! one health server, `select!` on whichever dies first) into a
//! multi-listener daemon that can gain/lose/reconfigure servers at runtime
//! without dropping established connections, per §4.J / §4.I.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::backend::Gateway;
use crate::config::AppConfig;
use crate::events::{Event, EventBus};
use crate::logging::DaemonLogger;
use crate::pool::EnvelopePool;
use crate::protocol::AllowedHosts;
use crate::smtp::Server;

/// A running listener plus the task driving its accept loop, so shutdown
/// can join it after asking it to stop.
struct ServerHandle {
    server: Arc<Server>,
    task: JoinHandle<()>,
}

/// Owns every long-lived component and the current configuration snapshot
/// used to diff the next `reload_config` call against.
pub struct Daemon {
    logger: &'static DaemonLogger,
    gateway: Arc<Gateway>,
    allowed_hosts: Arc<AllowedHosts>,
    envelope_pool: Arc<EnvelopePool>,
    events: Arc<EventBus>,
    servers: tokio::sync::Mutex<HashMap<String, ServerHandle>>,
    config: tokio::sync::Mutex<AppConfig>,
}

impl Daemon {
    /// Start-up order per §4.J: logger first (so every subsequent step can
    /// log), then the backend gateway, then one `Server` per configured
    /// listener, then event subscriptions, then each server's accept loop
    /// as its own task. Returns once every listener has bound successfully
    /// (the "start barrier").
    pub async fn start(config: AppConfig, logger: &'static DaemonLogger) -> Result<Arc<Daemon>> {
        let gateway = Arc::new(Gateway::new(&config.backend_config).context("failed to build backend gateway")?);
        let allowed_hosts = Arc::new(AllowedHosts::new(&config.allowed_hosts));
        let envelope_pool = Arc::new(EnvelopePool::new());
        let events = Arc::new(EventBus::new());

        let daemon = Arc::new(Daemon {
            logger,
            gateway,
            allowed_hosts,
            envelope_pool,
            events,
            servers: tokio::sync::Mutex::new(HashMap::new()),
            config: tokio::sync::Mutex::new(config.clone()),
        });

        daemon.install_subscriptions();

        let mut servers = daemon.servers.lock().await;
        for server_config in &config.servers {
            if !server_config.is_enabled {
                continue;
            }
            let handle = daemon.spawn_server(server_config.clone()).await?;
            servers.insert(server_config.key().to_string(), handle);
        }
        drop(servers);

        if !config.pid_file.is_empty() {
            write_pid_file(&config.pid_file)?;
        }

        log::info!(
            "daemon started with {} listener(s)",
            daemon.servers.lock().await.len()
        );
        Ok(daemon)
    }

    /// Binds one listener and spawns its accept loop, waiting for the bind
    /// to succeed before returning (§4.J "wait on a per-server start
    /// barrier").
    async fn spawn_server(self: &Arc<Self>, server_config: crate::config::ServerConfig) -> Result<ServerHandle> {
        let server = Arc::new(Server::new(
            server_config,
            Arc::clone(&self.allowed_hosts),
            Arc::clone(&self.gateway),
            Arc::clone(&self.envelope_pool),
        ));

        let (bound_tx, bound_rx) = tokio::sync::oneshot::channel();
        let run_server = Arc::clone(&server);
        let task = tokio::spawn(async move {
            if let Err(e) = run_server.run_with_ready_signal(Some(bound_tx)).await {
                log::error!("listener {} stopped: {e:#}", run_server.listen_interface());
            }
        });

        bound_rx
            .await
            .context("server task ended before it could bind its listener")?
            .context("failed to bind listener")?;

        Ok(ServerHandle { server, task })
    }

    /// Subscribes the daemon's own handlers to the topics it cares about
    /// directly (logging, allowed hosts); per-server topics are applied by
    /// `reload_config` against the live `servers` map instead of through
    /// the bus, since a handler closure can't borrow `self.servers`
    /// mutably without its own synchronization duplicate of the one this
    /// struct already has.
    fn install_subscriptions(self: &Arc<Self>) {
        let logger = self.logger;
        let allowed_hosts = Arc::clone(&self.allowed_hosts);
        self.events.subscribe(move |event| match event {
            Event::LogLevel(config) => {
                logger.set_level(crate::logging::parse_level(&config.log_level));
            }
            Event::LogFile(config) => {
                if let Err(e) = logger.set_sink(&config.log_file) {
                    log::error!("failed to apply LogFile event: {e:#}");
                }
            }
            Event::LogReopen => {
                if let Err(e) = logger.reopen() {
                    log::error!("failed to reopen log sink: {e:#}");
                }
            }
            Event::AllowedHosts(config) => {
                allowed_hosts.set(&config.allowed_hosts);
            }
            _ => {}
        });
    }

    /// Diffs `new_config` against the previously applied snapshot and
    /// publishes the corresponding events (§4.J Reload): added listeners
    /// are started, removed ones shut down, disabled ones stopped, and
    /// surviving ones get their atomic snapshot swapped in place so no
    /// connection already in flight is disturbed.
    pub async fn reload_config(self: &Arc<Self>, new_config: AppConfig) -> Result<()> {
        new_config.validate().context("rejected reload: invalid configuration")?;

        let mut current = self.config.lock().await;

        if current.log_file != new_config.log_file {
            self.events.publish(Event::LogFile(new_config.clone()));
        }
        if current.log_level != new_config.log_level {
            self.events.publish(Event::LogLevel(new_config.clone()));
        }
        if current.allowed_hosts != new_config.allowed_hosts {
            self.events.publish(Event::AllowedHosts(new_config.clone()));
        }
        if current.backend_config.save_process != new_config.backend_config.save_process
            || current.backend_config.validate_process != new_config.backend_config.validate_process
        {
            // The running worker pool's processor chain is not hot-swappable
            // without risking requests mid-flight against a half-replaced
            // chain (§4.H only describes a daemon-level `reinitialize` for
            // recovering a *shuttered* gateway, not for changing its
            // chain). A `save_process`/`validate_process` edit is logged
            // and otherwise takes effect on the next process restart.
            log::warn!(
                "backend_config processor chain changed in reloaded config; restart the daemon to apply it"
            );
            self.events.publish(Event::BackendConfig(new_config.clone()));
        }

        self.reconcile_servers(&current.servers, &new_config.servers).await?;

        *current = new_config;
        Ok(())
    }

    async fn reconcile_servers(
        self: &Arc<Self>,
        old: &[crate::config::ServerConfig],
        new: &[crate::config::ServerConfig],
    ) -> Result<()> {
        let old_by_key: HashMap<&str, &crate::config::ServerConfig> =
            old.iter().map(|s| (s.key(), s)).collect();
        let new_by_key: HashMap<&str, &crate::config::ServerConfig> =
            new.iter().map(|s| (s.key(), s)).collect();

        let mut servers = self.servers.lock().await;

        // Removed or disabled listeners: shut down and drop.
        for (key, _) in old_by_key.iter() {
            let still_wanted = new_by_key.get(key).map(|s| s.is_enabled).unwrap_or(false);
            if !still_wanted {
                if let Some(handle) = servers.remove(*key) {
                    log::info!("listener {key} removed or disabled; shutting down");
                    handle.server.shutdown().await;
                    let _ = handle.task.await;
                    self.events.publish(Event::ServerRemove(key.to_string()));
                }
            }
        }

        // New or re-enabled listeners: spawn.
        for (key, server_config) in new_by_key.iter() {
            if server_config.is_enabled && !servers.contains_key(*key) {
                log::info!("listener {key} added; starting");
                let handle = self.spawn_server((*server_config).clone()).await?;
                servers.insert(key.to_string(), handle);
                self.events.publish(Event::ServerNew((*server_config).clone()));
            }
        }

        // Surviving listeners: push the new snapshot in place.
        for (key, server_config) in new_by_key.iter() {
            if let Some(old_config) = old_by_key.get(key) {
                if server_config.is_enabled {
                    if let Some(handle) = servers.get(*key) {
                        handle.server.update_config((*server_config).clone());
                        if old_config.tls.file_fingerprint() != server_config.tls.file_fingerprint()
                            || format!("{:?}", old_config.tls.protocols) != format!("{:?}", server_config.tls.protocols)
                            || format!("{:?}", old_config.tls.ciphers) != format!("{:?}", server_config.tls.ciphers)
                        {
                            self.events
                                .publish(Event::ServerTLSConfig((*server_config).clone()));
                        }
                        if old_config.timeout != server_config.timeout {
                            self.events.publish(Event::ServerTimeout((*server_config).clone()));
                        }
                        if old_config.max_clients != server_config.max_clients {
                            self.events
                                .publish(Event::ServerMaxClients((*server_config).clone()));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Re-opens the active log sink in place (§4.J `ReopenLogs`), the
    /// conventional `logrotate`/SIGHUP hook.
    pub fn reopen_logs(&self) {
        self.events.publish(Event::LogReopen);
    }

    /// Reinitializes the backend gateway after an external failure placed
    /// it in the shuttered state (§4.H).
    pub fn reinitialize_gateway(&self) {
        self.gateway.reinitialize();
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub async fn active_listener_count(&self) -> usize {
        self.servers.lock().await.len()
    }

    /// Shutdown order per §4.J: stop accepting on every listener, drain
    /// in-flight connections, then the gateway.
    pub async fn shutdown(self: &Arc<Self>) {
        log::info!("daemon shutting down");
        let mut servers = self.servers.lock().await;
        for (key, handle) in servers.drain() {
            log::info!("shutting down listener {key}");
            handle.server.shutdown().await;
            let _ = handle.task.await;
        }
        drop(servers);
        self.gateway.shuttered_for_shutdown();
    }
}

fn write_pid_file(path: &str) -> Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("failed to write pid file {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::logging::Sink;

    /// Reserves an ephemeral port by binding synchronously then dropping
    /// the listener, matching the teacher's integration-test `get_free_port`
    /// helper (`tests/integration.rs`) since `listen_interface` doubles as
    /// this daemon's server map key and two listeners can't share one.
    fn free_port() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        format!("127.0.0.1:{}", listener.local_addr().unwrap().port())
    }

    fn free_port_config() -> AppConfig {
        AppConfig {
            servers: vec![ServerConfig {
                listen_interface: free_port(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_and_shutdown_round_trips() {
        let logger = DaemonLogger::new(Sink::Stderr, log::LevelFilter::Off)
            .unwrap();
        // Not installed globally in tests to avoid clobbering the test
        // harness's own logger; exercised directly as a plain value.
        let logger: &'static DaemonLogger = Box::leak(Box::new(logger));

        let daemon = Daemon::start(free_port_config(), logger).await.unwrap();
        assert_eq!(daemon.active_listener_count().await, 1);
        daemon.shutdown().await;
        assert_eq!(daemon.active_listener_count().await, 0);
    }

    #[tokio::test]
    async fn reload_adds_and_removes_listeners() {
        let logger = DaemonLogger::new(Sink::Stderr, log::LevelFilter::Off).unwrap();
        let logger: &'static DaemonLogger = Box::leak(Box::new(logger));

        let daemon = Daemon::start(free_port_config(), logger).await.unwrap();
        assert_eq!(daemon.active_listener_count().await, 1);

        let mut two_servers = free_port_config();
        two_servers.servers.push(ServerConfig {
            listen_interface: free_port(),
            hostname: "second".to_string(),
            ..Default::default()
        });

        daemon.reload_config(two_servers).await.unwrap();
        assert_eq!(daemon.active_listener_count().await, 2);
        daemon.shutdown().await;
    }
}
