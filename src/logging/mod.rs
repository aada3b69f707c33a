//! Hot-swappable logging sink (§2.1 of the expanded spec, §4.I `LogFile` /
//! `LogReopen` / `LogLevel` events).
//!
//! The teacher installs `env_logger` once at process start and never
//! touches it again. A daemon that reconfigures without dropping
//! connections needs more: the active sink and level must be swappable out
//! from under already-running connection tasks. `DaemonLogger` implements
//! `log::Log` directly and keeps its mutable state behind an `ArcSwap`, so
//! readers (every `log::info!`/`log::debug!` call site in the process) pay
//! only an atomic load, and reconfiguration is a single atomic store.
//!
//! `ServerConfig.log_file` is accepted and validated per §6 but, per §1's
//! "logger is a levelled append sink abstraction" scoping, all listeners
//! share this one process-wide sink rather than each opening its own file —
//! `ServerLogFile`/`ServerLogReopen` are recognized event topics (§4.I) a
//! future per-listener sink could hang off of, but today they're no-ops the
//! daemon never publishes; see `DESIGN.md`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::config::STDERR_SENTINEL;

/// Where log lines currently go. File rotation itself is out of scope here
/// (§1 Non-goals) — re-opening in append mode on `LogReopen` is the whole of
/// what this sink does for external log rotation tools (e.g. `logrotate`).
#[derive(Clone)]
pub enum Sink {
    Stderr,
    File(PathBuf),
}

impl Sink {
    pub fn from_config_value(value: &str) -> Self {
        if value == STDERR_SENTINEL || value.is_empty() {
            Sink::Stderr
        } else {
            Sink::File(PathBuf::from(value))
        }
    }

    fn open_writer(&self) -> Result<Box<dyn Write + Send>> {
        match self {
            Sink::Stderr => Ok(Box::new(std::io::stderr())),
            Sink::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open log file {}", path.display()))?;
                Ok(Box::new(file))
            }
        }
    }
}

struct SinkState {
    sink: Sink,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl SinkState {
    fn open(sink: Sink) -> Result<Self> {
        let writer = sink.open_writer()?;
        Ok(SinkState {
            sink,
            writer: Mutex::new(writer),
        })
    }

    fn write_line(&self, line: &str) {
        let mut writer = self.writer.lock().expect("log sink mutex poisoned");
        let _ = writeln!(writer, "{line}");
        let _ = writer.flush();
    }
}

/// A `log::Log` implementation backed by an atomically swappable sink and
/// level, installed once via `log::set_boxed_logger` at daemon start.
pub struct DaemonLogger {
    state: ArcSwap<SinkState>,
    level: ArcSwap<LevelFilter>,
}

impl DaemonLogger {
    pub fn new(sink: Sink, level: LevelFilter) -> Result<Self> {
        Ok(DaemonLogger {
            state: ArcSwap::from_pointee(SinkState::open(sink)?),
            level: ArcSwap::from_pointee(level),
        })
    }

    /// Installs this logger as the process-global `log` backend via
    /// `log::set_logger`. Call exactly once, at daemon start (§4.J
    /// "construct logger").
    pub fn install(self) -> Result<&'static DaemonLogger> {
        let leaked: &'static DaemonLogger = Box::leak(Box::new(self));
        log::set_logger(leaked).context("a logger is already installed")?;
        log::set_max_level(**leaked.level.load());
        Ok(leaked)
    }

    /// Applies a `LogFile` event: swaps in a freshly opened sink for the new
    /// path/sentinel.
    pub fn set_sink(&self, value: &str) -> Result<()> {
        let sink = Sink::from_config_value(value);
        let state = SinkState::open(sink)?;
        self.state.store(std::sync::Arc::new(state));
        Ok(())
    }

    /// Applies a `LogLevel` event.
    pub fn set_level(&self, level: LevelFilter) {
        self.level.store(std::sync::Arc::new(level));
        log::set_max_level(level);
    }

    /// Applies a `LogReopen` event: re-opens the current file sink in append
    /// mode, picking up e.g. a `logrotate` rename without restarting.
    pub fn reopen(&self) -> Result<()> {
        let current = self.state.load();
        let state = SinkState::open(current.sink.clone())?;
        self.state.store(std::sync::Arc::new(state));
        Ok(())
    }
}

impl Log for DaemonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= **self.level.load()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{} {} {}] {}",
            humantime_timestamp(),
            record.level(),
            record.target(),
            record.args()
        );
        self.state.load().write_line(&line);
    }

    fn flush(&self) {
        let state = self.state.load();
        let mut writer = state.writer.lock().expect("log sink mutex poisoned");
        let _ = writer.flush();
    }
}

/// An RFC3339-ish timestamp without pulling in a dedicated time-formatting
/// crate, matching the scope of what this sink needs (just a readable
/// prefix, not wall-clock precision).
fn humantime_timestamp() -> String {
    let now = std::time::SystemTime::now();
    let since_epoch = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", since_epoch.as_secs(), since_epoch.subsec_millis())
}

/// Parses the `log_level` config string into a `LevelFilter`, defaulting to
/// `Info` for anything unrecognized rather than failing startup over a typo.
pub fn parse_level(value: &str) -> LevelFilter {
    match value.to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        other => {
            eprintln!("unrecognized log_level '{other}', defaulting to info");
            LevelFilter::Info
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_value_recognizes_stderr_sentinel() {
        assert!(matches!(Sink::from_config_value("stderr"), Sink::Stderr));
        assert!(matches!(Sink::from_config_value(""), Sink::Stderr));
    }

    #[test]
    fn from_config_value_treats_other_strings_as_file_paths() {
        match Sink::from_config_value("/var/log/guerrilla-ingest.log") {
            Sink::File(path) => assert_eq!(path, PathBuf::from("/var/log/guerrilla-ingest.log")),
            Sink::Stderr => panic!("expected a file sink"),
        }
    }

    #[test]
    fn parse_level_accepts_known_names_case_insensitively() {
        assert_eq!(parse_level("DEBUG"), LevelFilter::Debug);
        assert_eq!(parse_level("warn"), LevelFilter::Warn);
    }

    #[test]
    fn parse_level_defaults_unknown_to_info() {
        assert_eq!(parse_level("whatever"), LevelFilter::Info);
    }

    #[test]
    fn set_level_updates_enabled_check() {
        let logger = DaemonLogger::new(Sink::Stderr, LevelFilter::Info).unwrap();
        assert!(!logger.enabled(&Metadata::builder().level(Level::Debug).target("x").build()));
        logger.set_level(LevelFilter::Debug);
        assert!(logger.enabled(&Metadata::builder().level(Level::Debug).target("x").build()));
    }

    #[test]
    fn set_sink_and_reopen_to_file_round_trip() {
        let path = std::env::temp_dir().join(format!("guerrilla-ingest-log-test-{}.log", std::process::id()));
        let logger = DaemonLogger::new(Sink::Stderr, LevelFilter::Info).unwrap();
        logger.set_sink(path.to_str().unwrap()).unwrap();
        logger.reopen().unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
