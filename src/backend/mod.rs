//! The backend gateway: a worker-pool façade around an ordered chain of
//! processors (§4.H). Generalizes the teacher's single-purpose
//! `WebhookClient::forward_email` call site into a pluggable pipeline while
//! keeping its "fire the request, log the outcome, never let a backend
//! hiccup take down a connection" posture.

pub mod processors;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::config::BackendConfig;
use crate::pool::Envelope;

/// Registry of processor names the configuration validator accepts (§4.H /
/// §9). Kept in one place so `config::AppConfig::validate` and the gateway's
/// chain-builder can never disagree about what's "known".
pub const KNOWN_PROCESSORS: &[&str] = &[
    "HeadersParser",
    "Header",
    "Debugger",
    "Hasher",
    "Webhook",
];

/// The two task kinds the gateway dispatches to worker tasks (§4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    ValidateRcpt,
    SaveMail,
}

/// Outcome of running a processor chain, mirroring an SMTP reply tuple so
/// the connection task can relay it directly (§4.H, §4.D).
#[derive(Debug, Clone)]
pub struct GatewayResult {
    pub code: u16,
    pub message: String,
}

impl GatewayResult {
    pub fn is_success(&self) -> bool {
        self.code < 300
    }

    fn ok(message: impl Into<String>) -> Self {
        GatewayResult {
            code: 250,
            message: message.into(),
        }
    }
}

/// Backend-facing failure modes (§4.H, §4.D "Backend-transient"/"Backend-fatal").
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// A processor panicked, or returned an application-level failure.
    StorageFailed(String),
    /// The task exceeded its configured deadline.
    TransactionTimeout,
    /// The gateway has been shuttered following an earlier external failure.
    Shuttered,
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::StorageFailed(reason) => write!(f, "storage failed: {reason}"),
            GatewayError::TransactionTimeout => write!(f, "transaction timeout"),
            GatewayError::Shuttered => write!(f, "backend gateway is shuttered"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// A stateless step in a processor chain (§3: "processors are stateless
/// functions of `(envelope, task) → result`"). Each processor decorates the
/// next so side effects can run before and/or after the tail call, mirroring
/// the teacher's `forward_email` "do the work, log the outcome" style.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs this processor's work, then calls `next` to continue the chain.
    /// Returning `Err` short-circuits the remaining processors.
    async fn process(
        &self,
        envelope: &mut Envelope,
        task: Task,
        next: Next<'_>,
    ) -> Result<GatewayResult>;
}

/// The remaining suffix of the chain, invoked by a [`Processor`] to continue
/// past itself.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Processor>],
}

impl<'a> Next<'a> {
    pub async fn call(self, envelope: &mut Envelope, task: Task) -> Result<GatewayResult> {
        match self.remaining.split_first() {
            Some((head, rest)) => head.process(envelope, task, Next { remaining: rest }).await,
            None => Ok(GatewayResult::ok("chain complete")),
        }
    }
}

async fn run_chain(
    chain: Arc<Vec<Arc<dyn Processor>>>,
    mut envelope: Envelope,
    task: Task,
) -> (Envelope, Result<GatewayResult>) {
    let result = Next { remaining: chain.as_slice() }.call(&mut envelope, task).await;
    (envelope, result)
}

enum Request {
    ValidateRcpt {
        envelope: Envelope,
        reply: oneshot::Sender<(Envelope, Result<(), GatewayError>)>,
    },
    SaveMail {
        envelope: Envelope,
        reply: oneshot::Sender<(Envelope, Result<GatewayResult, GatewayError>)>,
    },
}

/// A worker-pool façade around a configured processor chain (§4.H).
///
/// `ValidateRcpt`/`Process` hand an owned [`Envelope`] to a bounded pool of
/// worker tasks over an mpsc channel and await the reply on a one-shot
/// channel, matching the spec's "requests cross into it via a channel"
/// concurrency model (§5) without needing raw OS threads.
pub struct Gateway {
    sender: mpsc::Sender<Request>,
    shuttered: Arc<AtomicBool>,
    save_timeout: Duration,
    validate_timeout: Duration,
}

impl Gateway {
    /// Builds the gateway, spawning `worker_count` tasks that each share the
    /// configured validate/save chains.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let save_chain = Arc::new(build_chain(&config.save_chain(), config)?);
        let validate_chain = Arc::new(build_chain(&config.validate_chain(), config)?);
        let worker_count = config.worker_count();

        let (sender, receiver) = mpsc::channel(worker_count * 4);

        spawn_workers(worker_count, receiver, save_chain, validate_chain);

        Ok(Gateway {
            sender,
            shuttered: Arc::new(AtomicBool::new(false)),
            save_timeout: config.save_timeout(),
            validate_timeout: config.validate_timeout(),
        })
    }

    pub fn is_shuttered(&self) -> bool {
        self.shuttered.load(Ordering::SeqCst)
    }

    /// Marks the gateway shuttered as part of an orderly daemon shutdown,
    /// so any request still arriving after listeners have stopped accepting
    /// fails fast instead of queuing behind workers that are about to stop
    /// being polled (§4.J shutdown sequencing).
    pub fn shuttered_for_shutdown(&self) {
        self.shuttered.store(true, Ordering::SeqCst);
    }

    /// Reopens the gateway after an external failure, per the daemon-level
    /// reinitialize call described in §4.H.
    pub fn reinitialize(&self) {
        self.shuttered.store(false, Ordering::SeqCst);
    }

    pub async fn validate_rcpt(&self, envelope: Envelope) -> (Envelope, Result<(), GatewayError>) {
        if self.is_shuttered() {
            return (envelope, Err(GatewayError::Shuttered));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .sender
            .send(Request::ValidateRcpt { envelope, reply: reply_tx })
            .await
            .is_err()
        {
            return (Envelope::default(), Err(GatewayError::Shuttered));
        }

        match timeout(self.validate_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => (Envelope::default(), Err(GatewayError::Shuttered)),
            Err(_) => (Envelope::default(), Err(GatewayError::TransactionTimeout)),
        }
    }

    pub async fn process(&self, envelope: Envelope) -> (Envelope, Result<GatewayResult, GatewayError>) {
        if self.is_shuttered() {
            return (envelope, Err(GatewayError::Shuttered));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .sender
            .send(Request::SaveMail { envelope, reply: reply_tx })
            .await
            .is_err()
        {
            return (Envelope::default(), Err(GatewayError::Shuttered));
        }

        match timeout(self.save_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => (Envelope::default(), Err(GatewayError::Shuttered)),
            Err(_) => (Envelope::default(), Err(GatewayError::TransactionTimeout)),
        }
    }
}

fn spawn_workers(
    worker_count: usize,
    receiver: mpsc::Receiver<Request>,
    save_chain: Arc<Vec<Arc<dyn Processor>>>,
    validate_chain: Arc<Vec<Arc<dyn Processor>>>,
) {
    // tokio::mpsc has a single consumer, so workers share it behind a lock
    // and take turns popping the next request — a cheap fan-out since the
    // actual processing happens in a spawned task per request, not here.
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

    for worker_id in 0..worker_count {
        let receiver = Arc::clone(&receiver);
        let save_chain = Arc::clone(&save_chain);
        let validate_chain = Arc::clone(&validate_chain);

        tokio::spawn(async move {
            loop {
                let request = {
                    let mut receiver = receiver.lock().await;
                    receiver.recv().await
                };
                let Some(request) = request else {
                    log::debug!("backend worker {worker_id}: channel closed, exiting");
                    break;
                };

                handle_request(request, &save_chain, &validate_chain).await;
            }
        });
    }
}

async fn handle_request(
    request: Request,
    save_chain: &Arc<Vec<Arc<dyn Processor>>>,
    validate_chain: &Arc<Vec<Arc<dyn Processor>>>,
) {
    match request {
        Request::ValidateRcpt { envelope, reply } => {
            let (envelope, outcome) =
                run_guarded(Arc::clone(validate_chain), envelope, Task::ValidateRcpt).await;
            let _ = reply.send((envelope, outcome.map(|_| ())));
        }
        Request::SaveMail { envelope, reply } => {
            let (envelope, outcome) = run_guarded(Arc::clone(save_chain), envelope, Task::SaveMail).await;
            let _ = reply.send((envelope, outcome));
        }
    }
}

/// Runs the chain on its own spawned task so a processor panic is caught by
/// tokio's task join rather than unwinding into the worker loop (§4.H: "If a
/// processor panics, the gateway recovers, logs, and returns a storage
/// failed result"). An ordinary `Err` from a processor is treated the same
/// way — both surface as `StorageFailed` to the connection task, which
/// replies 4xx and resets. A panic poisons only the request that triggered
/// it, not the gateway as a whole — `shuttered` is reserved for external
/// failures (e.g. config) per §4.H, so the worker keeps serving the next
/// request after logging this one.
async fn run_guarded(
    chain: Arc<Vec<Arc<dyn Processor>>>,
    envelope: Envelope,
    task: Task,
) -> (Envelope, Result<GatewayResult, GatewayError>) {
    match tokio::spawn(run_chain(chain, envelope, task)).await {
        Ok((envelope, Ok(result))) => (envelope, Ok(result)),
        Ok((envelope, Err(err))) => (envelope, Err(GatewayError::StorageFailed(err.to_string()))),
        Err(join_err) => {
            let reason = if join_err.is_panic() {
                panic_message(join_err.into_panic())
            } else {
                "worker task cancelled".to_string()
            };
            log::error!("backend worker: processor chain failed: {reason}");
            (Envelope::default(), Err(GatewayError::StorageFailed(reason)))
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn build_chain(names: &[String], config: &BackendConfig) -> Result<Vec<Arc<dyn Processor>>> {
    names
        .iter()
        .map(|name| processors::build(name, config))
        .collect::<Result<Vec<_>, String>>()
        .map_err(|e| anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn envelope() -> Envelope {
        Envelope {
            remote_ip: "127.0.0.1".to_string(),
            data: b"Subject: hi\r\n\r\nbody".to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn process_runs_configured_chain_and_succeeds() {
        let config = BackendConfig {
            save_process: "HeadersParser|Header|Debugger".to_string(),
            ..Default::default()
        };
        let gateway = Gateway::new(&config).unwrap();
        let (envelope, result) = gateway.process(envelope()).await;
        let result = result.unwrap();
        assert!(result.is_success());
        assert!(envelope.header.contains_key("Subject"));
    }

    #[tokio::test]
    async fn validate_rcpt_with_empty_chain_succeeds() {
        let config = BackendConfig::default();
        let gateway = Gateway::new(&config).unwrap();
        let (_, result) = gateway.validate_rcpt(envelope()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unknown_processor_name_fails_to_build() {
        let config = BackendConfig {
            save_process: "NotReal".to_string(),
            ..Default::default()
        };
        assert!(Gateway::new(&config).is_err());
    }

    #[tokio::test]
    async fn reinitialize_clears_shuttered_state() {
        let config = BackendConfig::default();
        let gateway = Gateway::new(&config).unwrap();
        gateway.shuttered.store(true, Ordering::SeqCst);
        assert!(gateway.is_shuttered());
        gateway.reinitialize();
        assert!(!gateway.is_shuttered());
    }
}
