//! Application configuration: a struct-of-structs value object (§6), loaded
//! from JSON. Generalizes the teacher's `Config::from_env` (env-var based,
//! single-server) into the multi-listener, JSON-shaped value object the
//! spec calls for, keeping the same "collect one specific, logged error per
//! bad field" style via `anyhow::Context`.


use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::KNOWN_PROCESSORS;

/// Sentinel written into `LogFile` / `Server.log_file` meaning "stderr".
pub const STDERR_SENTINEL: &str = "stderr";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientAuthMode {
    NoClientCert,
    RequestClientCert,
    RequireAnyClientCert,
    VerifyClientCertIfGiven,
    RequireAndVerifyClientCert,
}

impl Default for ClientAuthMode {
    fn default() -> Self {
        ClientAuthMode::NoClientCert
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub start_tls_on: bool,
    #[serde(default)]
    pub always_on: bool,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    /// `tls1.0|tls1.1|tls1.2`
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,
    /// IANA cipher suite names.
    #[serde(default)]
    pub ciphers: Vec<String>,
    /// `P256|P384|P521`
    #[serde(default)]
    pub curves: Vec<String>,
    #[serde(default)]
    pub client_auth_type: ClientAuthMode,
    #[serde(default)]
    pub prefer_server_cipher_suites: bool,
    #[serde(default)]
    pub root_cas: Option<String>,
}

fn default_protocols() -> Vec<String> {
    vec!["tls1.2".to_string()]
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            start_tls_on: false,
            always_on: false,
            cert_file: String::new(),
            key_file: String::new(),
            protocols: default_protocols(),
            ciphers: Vec::new(),
            curves: Vec::new(),
            client_auth_type: ClientAuthMode::default(),
            prefer_server_cipher_suites: false,
            root_cas: None,
        }
    }
}

impl TlsConfig {
    pub fn tls_enabled(&self) -> bool {
        self.always_on || self.start_tls_on
    }

    /// Captures cert/key mtimes so a reload can detect key rotation even
    /// when the configured paths themselves didn't change (§9 design note).
    pub fn file_fingerprint(&self) -> Option<(SystemTime, SystemTime)> {
        if !self.tls_enabled() {
            return None;
        }
        let cert_mtime = fs::metadata(&self.cert_file).and_then(|m| m.modified()).ok()?;
        let key_mtime = fs::metadata(&self.key_file).and_then(|m| m.modified()).ok()?;
        Some((cert_mtime, key_mtime))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_interface: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub xclient_on: bool,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_max_size() -> u64 {
    10 * 1024 * 1024
}
fn default_timeout() -> u64 {
    30
}
fn default_max_clients() -> usize {
    100
}
fn default_true() -> bool {
    true
}
fn default_log_file() -> String {
    STDERR_SENTINEL.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_interface: "127.0.0.1:2525".to_string(),
            hostname: default_hostname(),
            max_size: default_max_size(),
            timeout: default_timeout(),
            max_clients: default_max_clients(),
            is_enabled: true,
            xclient_on: false,
            log_file: default_log_file(),
            tls: TlsConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Unique identity for diffing two listener lists across a reload:
    /// the bind address, since that's what actually distinguishes servers.
    pub fn key(&self) -> &str {
        &self.listen_interface
    }
}

fn default_hostname() -> String {
    hostname_from_os().unwrap_or_else(|| "localhost".to_string())
}

fn hostname_from_os() -> Option<String> {
    std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty())
}

/// Recognized top-level keys of the free-form backend configuration map
/// (§9), modeled as a typed struct validated once at startup rather than
/// re-parsed per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_save_process")]
    pub save_process: String,
    #[serde(default = "default_validate_process")]
    pub validate_process: String,
    #[serde(default = "default_workers_size")]
    pub save_workers_size: usize,
    #[serde(default)]
    pub primary_mail_host: String,
    #[serde(default)]
    pub log_received_mails: bool,
    #[serde(default = "default_save_timeout")]
    pub gw_save_timeout: u64,
    #[serde(default = "default_val_rcpt_timeout")]
    pub gw_val_rcpt_timeout: u64,
    /// Processor-scoped keys, looked up by each processor at registration.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_save_process() -> String {
    "HeadersParser|Header|Debugger".to_string()
}
fn default_validate_process() -> String {
    String::new()
}
fn default_workers_size() -> usize {
    4
}
fn default_save_timeout() -> u64 {
    30
}
fn default_val_rcpt_timeout() -> u64 {
    5
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            save_process: default_save_process(),
            validate_process: default_validate_process(),
            save_workers_size: default_workers_size(),
            primary_mail_host: String::new(),
            log_received_mails: false,
            gw_save_timeout: default_save_timeout(),
            gw_val_rcpt_timeout: default_val_rcpt_timeout(),
            extra: serde_json::Map::new(),
        }
    }
}

impl BackendConfig {
    pub fn save_chain(&self) -> Vec<String> {
        split_chain(&self.save_process)
    }

    pub fn validate_chain(&self) -> Vec<String> {
        split_chain(&self.validate_process)
    }

    pub fn save_timeout(&self) -> Duration {
        Duration::from_secs(self.gw_save_timeout)
    }

    pub fn validate_timeout(&self) -> Duration {
        Duration::from_secs(self.gw_val_rcpt_timeout)
    }

    /// Worker count, clamped to at least 1 (§3 supplement: a misconfigured
    /// `0` would otherwise deadlock the gateway instead of just warning).
    pub fn worker_count(&self) -> usize {
        if self.save_workers_size == 0 {
            log::warn!("backend config: save_workers_size=0 is invalid, using 1");
            1
        } else {
            self.save_workers_size
        }
    }
}

fn split_chain(spec: &str) -> Vec<String> {
    spec.split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub pid_file: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub backend_config: BackendConfig,
    #[serde(default = "default_servers")]
    pub servers: Vec<ServerConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_servers() -> Vec<ServerConfig> {
    vec![ServerConfig::default()]
}

impl AppConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: AppConfig =
            serde_json::from_str(raw).context("failed to parse configuration JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    /// Fails fast on configuration that cannot possibly run: unknown
    /// processor names, no listeners, or a TLS block with certs but no
    /// `start_tls_on`/`always_on` flag set (dead configuration).
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(anyhow!("AppConfig.servers must not be empty"));
        }

        for name in self
            .backend_config
            .save_chain()
            .iter()
            .chain(self.backend_config.validate_chain().iter())
        {
            if !KNOWN_PROCESSORS.contains(&name.as_str()) {
                return Err(anyhow!(
                    "unknown processor '{name}' in backend_config chain; known: {:?}",
                    KNOWN_PROCESSORS
                ));
            }
        }

        let mut seen_interfaces: HashMap<&str, ()> = HashMap::new();
        for server in &self.servers {
            if seen_interfaces.insert(server.key(), ()).is_some() {
                return Err(anyhow!(
                    "duplicate listen_interface '{}' across servers",
                    server.key()
                ));
            }

            if server.tls.tls_enabled() {
                if server.tls.cert_file.is_empty() || server.tls.key_file.is_empty() {
                    return Err(anyhow!(
                        "server '{}' enables TLS but is missing cert_file/key_file",
                        server.key()
                    ));
                }
                crate::tls::validate_tls_fields(&server.tls).with_context(|| {
                    format!("server '{}' has an invalid TLS configuration", server.key())
                })?;
            }
        }

        Ok(())
    }
}
