//! Typed pub/sub event bus for hot-reconfiguration (§4.I).
//!
//! Handlers run synchronously on the publisher's task/thread and receive
//! either the whole [`AppConfig`](crate::config::AppConfig) or a single
//! [`ServerConfig`](crate::config::ServerConfig) snapshot, per spec. This
//! mirrors the teacher's preference for plain owned values over a generic
//! messaging framework (no `acton-reactive`-style actor runtime): a
//! closure registry keyed by a fixed enum, guarded by a single mutex.

use std::sync::Mutex;

use crate::config::{AppConfig, ServerConfig};

/// The fixed enumeration of reconfiguration topics (§4.I).
#[derive(Debug, Clone)]
pub enum Event {
    NewConfig(AppConfig),
    AllowedHosts(AppConfig),
    PidFile(AppConfig),
    LogFile(AppConfig),
    LogReopen,
    LogLevel(AppConfig),
    BackendConfig(AppConfig),
    ServerNew(ServerConfig),
    ServerRemove(String),
    ServerConfigChanged(ServerConfig),
    ServerStart(String),
    ServerStop(String),
    ServerLogFile(ServerConfig),
    ServerLogReopen(String),
    ServerTimeout(ServerConfig),
    ServerMaxClients(ServerConfig),
    ServerTLSConfig(ServerConfig),
}

impl Event {
    /// A short, stable name for logging — mirrors the teacher's
    /// `debug!("SMTP({:?}): ...")` style of logging states by their tag.
    pub fn topic(&self) -> &'static str {
        match self {
            Event::NewConfig(_) => "NewConfig",
            Event::AllowedHosts(_) => "AllowedHosts",
            Event::PidFile(_) => "PidFile",
            Event::LogFile(_) => "LogFile",
            Event::LogReopen => "LogReopen",
            Event::LogLevel(_) => "LogLevel",
            Event::BackendConfig(_) => "BackendConfig",
            Event::ServerNew(_) => "ServerNew",
            Event::ServerRemove(_) => "ServerRemove",
            Event::ServerConfigChanged(_) => "ServerConfig",
            Event::ServerStart(_) => "ServerStart",
            Event::ServerStop(_) => "ServerStop",
            Event::ServerLogFile(_) => "ServerLogFile",
            Event::ServerLogReopen(_) => "ServerLogReopen",
            Event::ServerTimeout(_) => "ServerTimeout",
            Event::ServerMaxClients(_) => "ServerMaxClients",
            Event::ServerTLSConfig(_) => "ServerTLSConfig",
        }
    }
}

type Handler = Box<dyn Fn(&Event) + Send + Sync>;

/// A synchronous, in-process pub/sub hub. The daemon and each server
/// subscribe to the slice of topics they care about.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<Vec<Handler>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a handler that is invoked, synchronously, for every
    /// published event. Handlers are expected to match on the topics they
    /// care about and ignore the rest — there is no per-topic filtering at
    /// subscription time, matching the teacher's preference for plain
    /// exhaustive `match` blocks over a routing layer.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .expect("event bus mutex poisoned")
            .push(Box::new(handler));
    }

    /// Publishes an event to every subscriber, in subscription order.
    pub fn publish(&self, event: Event) {
        log::debug!("event bus: publishing {}", event.topic());
        let handlers = self.handlers.lock().expect("event bus mutex poisoned");
        for handler in handlers.iter() {
            handler(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn subscribers_receive_published_events_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_a = Arc::clone(&seen);
        bus.subscribe(move |event| {
            if matches!(event, Event::LogReopen) {
                seen_a.fetch_add(1, Ordering::SeqCst);
            }
        });

        let seen_b = Arc::clone(&seen);
        bus.subscribe(move |event| {
            if matches!(event, Event::LogReopen) {
                seen_b.fetch_add(10, Ordering::SeqCst);
            }
        });

        bus.publish(Event::LogReopen);
        assert_eq!(seen.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn unrelated_topics_are_ignored_by_narrow_handlers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        bus.subscribe(move |event| {
            if let Event::ServerRemove(name) = event {
                assert_eq!(name, "listener-1");
                count_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        bus.publish(Event::LogReopen);
        bus.publish(Event::ServerRemove("listener-1".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
