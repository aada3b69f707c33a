//! A single listener: owns its `TcpListener`, admission pool, and an atomic
//! snapshot of its `ServerConfig` that reload events swap out from under it
//! (§4.G, §4.J).
//!
//! Generalizes the teacher's single hardcoded `Server::run` accept loop
//! (bind once, `tokio::spawn` per connection, never reconfigured) into one
//! instance per configured listener, each independently startable,
//! stoppable, and reconfigurable via the event bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use log::{error, info};
use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::backend::Gateway;
use crate::config::ServerConfig;
use crate::pool::connection::{ConnectionIdGenerator, ConnectionPool};
use crate::pool::EnvelopePool;
use crate::protocol::AllowedHosts;

use super::session::Session;
use super::stream::Stream;

/// Per-listener runtime state, reconfigurable in place via `ArcSwap` (§5
/// "Shared resources: the atomic configuration snapshots ... are read by
/// many connection tasks and written only by the event-bus handler").
pub struct Server {
    config: ArcSwap<ServerConfig>,
    allowed_hosts: Arc<AllowedHosts>,
    gateway: Arc<Gateway>,
    envelope_pool: Arc<EnvelopePool>,
    connection_pool: ConnectionPool<()>,
    connection_ids: ConnectionIdGenerator,
    shutting_down: Arc<AtomicBool>,
    shutdown_notify: Notify,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        allowed_hosts: Arc<AllowedHosts>,
        gateway: Arc<Gateway>,
        envelope_pool: Arc<EnvelopePool>,
    ) -> Self {
        let connection_pool = ConnectionPool::new(config.max_clients, config.timeout_duration());
        Server {
            config: ArcSwap::from_pointee(config),
            allowed_hosts,
            gateway,
            envelope_pool,
            connection_pool,
            connection_ids: ConnectionIdGenerator::new(),
            shutting_down: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Notify::new(),
        }
    }

    pub fn listen_interface(&self) -> String {
        self.config.load().listen_interface.clone()
    }

    /// Applies a reconfiguration event's updated snapshot (§4.I
    /// `ServerConfigChanged`/`ServerTimeout`/`ServerMaxClients`/`ServerTLSConfig`).
    pub fn update_config(&self, config: ServerConfig) {
        self.connection_pool.set_timeout(config.timeout_duration());
        self.config.store(Arc::new(config));
    }

    /// Binds and runs the accept loop until `shutdown` is called. Each
    /// accepted connection becomes its own `tokio::spawn`ed task, matching
    /// "one task per connection drives that connection's state machine
    /// from accept to close" (§5).
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.run_with_ready_signal(None).await
    }

    /// Same as [`Server::run`], but signals `ready` with the bind outcome
    /// as soon as it's known, letting the daemon's start-up barrier
    /// (§4.J "wait on a per-server start barrier") block only until every
    /// listener has actually bound, not until they've all exited.
    pub async fn run_with_ready_signal(
        self: Arc<Self>,
        ready: Option<tokio::sync::oneshot::Sender<Result<()>>>,
    ) -> Result<()> {
        let config = self.config.load();
        let always_on_tls = config.tls.always_on;
        let listen_interface = config.listen_interface.clone();
        drop(config);

        let listener = match TcpListener::bind(&listen_interface).await {
            Ok(listener) => listener,
            Err(e) => {
                let message = format!("failed to bind SMTP listener on {listen_interface}: {e}");
                if let Some(ready) = ready {
                    let _ = ready.send(Err(anyhow::anyhow!(message.clone())));
                }
                return Err(anyhow::anyhow!(message));
            }
        };
        info!("SMTP server listening on {listen_interface}");
        if let Some(ready) = ready {
            let _ = ready.send(Ok(()));
        }

        // Raced against `shutdown_notify` rather than checked only after
        // `accept()` returns: a bare post-accept check would leave this
        // loop blocked indefinitely on an idle listener even after
        // `shutdown()` flips `shutting_down`, since nothing would ever
        // wake it back up to notice (§4.E shutdown must promptly unwind
        // even a listener with no pending connections).
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (tcp_stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("error accepting connection on {listen_interface}: {e}");
                            continue;
                        }
                    };

                    if self.shutting_down.load(Ordering::SeqCst) {
                        break;
                    }

                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(tcp_stream, peer_addr, always_on_tls).await {
                            error!("error handling SMTP connection from {peer_addr}: {e:#}");
                        }
                    });
                }
                _ = self.shutdown_notify.notified() => {
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        tcp_stream: tokio::net::TcpStream,
        peer_addr: std::net::SocketAddr,
        always_on_tls: bool,
    ) -> Result<()> {
        let id = self.connection_ids.next_id();

        let lease = match self.connection_pool.borrow(id).await {
            Ok(lease) => lease,
            Err(_) => return Ok(()), // pool-shutting-down: drop the connection quietly
        };

        // From here on every exit path must reach `return_ctx(lease)` — a
        // `Lease` only drops its semaphore permit, the live-set entry it
        // registered in `borrow` is removed solely by `return_ctx` (§4.E).
        // An early `?` here would leave `id` live forever and hang
        // `shutdown_wait` (pool/connection.rs), so TLS setup and the
        // session run are captured into `Result`s instead of propagated.
        let result = self.drive_connection(tcp_stream, peer_addr, always_on_tls, id).await;
        self.connection_pool.return_ctx(lease);
        result
    }

    async fn drive_connection(
        &self,
        tcp_stream: tokio::net::TcpStream,
        peer_addr: std::net::SocketAddr,
        always_on_tls: bool,
        id: u64,
    ) -> Result<()> {
        let stream = if always_on_tls {
            let config = self.config.load();
            let acceptor = crate::tls::build_acceptor(&config.tls)?;
            drop(config);
            Stream::Tls(Box::new(acceptor.accept(tcp_stream).await?))
        } else {
            Stream::Plain(tcp_stream)
        };

        let envelope = self.envelope_pool.borrow(peer_addr.ip().to_string());
        let active_connections = self.connection_pool.live_count();
        let config = (**self.config.load()).clone();

        let session = Session::new(
            stream,
            envelope,
            id,
            active_connections,
            config,
            Arc::clone(&self.allowed_hosts),
            Arc::clone(&self.gateway),
            Arc::clone(&self.envelope_pool),
            Arc::clone(&self.shutting_down),
        );

        let result = session.run().await;
        match result {
            Ok(envelope) => {
                self.envelope_pool.release(envelope);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stops accepting new connections, drains live connections, and lowers
    /// their deadline to 1 second so they unwind promptly (§4.E
    /// `ShutdownState`/`ShutdownWait`, §4.J shutdown sequencing).
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_one();
        self.connection_pool.shutdown_state();
        self.connection_pool.shutdown_wait().await;
    }
}
