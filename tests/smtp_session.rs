//! End-to-end loopback tests driving the full SMTP state machine through a
//! real `Daemon` over a TCP socket, matching the shape of the teacher's own
//! `tests/integration.rs` (`get_free_port`, a hand-rolled SMTP client helper
//! speaking the wire protocol line by line) but against this crate's
//! `Daemon`/`Gateway` instead of spinning up a MockServer container, since
//! the in-process `Debugger` processor needs no external HTTP target.

use std::net::TcpListener as StdTcpListener;
use std::time::Duration;

use guerrilla_ingest::config::{AppConfig, ServerConfig, TlsConfig};
use guerrilla_ingest::daemon::Daemon;
use guerrilla_ingest::logging::{DaemonLogger, Sink};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

fn init_crypto() {
    rustls::crypto::aws_lc_rs::default_provider().install_default().ok();
}

fn free_port_addr() -> String {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("failed to bind to port 0");
    format!("127.0.0.1:{}", listener.local_addr().unwrap().port())
}

fn test_logger() -> &'static DaemonLogger {
    let logger = DaemonLogger::new(Sink::Stderr, log::LevelFilter::Off).unwrap();
    Box::leak(Box::new(logger))
}

async fn wait_for_connect(addr: &str, timeout: Duration) {
    let start = std::time::Instant::now();
    loop {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        if start.elapsed() > timeout {
            panic!("SMTP server at {addr} did not become ready within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

struct SmtpClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl SmtpClient {
    async fn connect(addr: &str) -> Self {
        wait_for_connect(addr, Duration::from_secs(5)).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        SmtpClient {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line
    }

    /// Reads lines until the final (space-separated, not dash-separated)
    /// line of a possibly-multiline reply, returning the last line read.
    async fn read_reply(&mut self) -> String {
        loop {
            let line = self.read_line().await;
            let is_last = line.len() >= 4 && line.as_bytes()[3] == b' ';
            if is_last {
                return line;
            }
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }
}

fn single_listener_config(addr: &str) -> AppConfig {
    AppConfig {
        servers: vec![ServerConfig {
            listen_interface: addr.to_string(),
            hostname: "mx.example.test".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn happy_path_delivers_a_message() {
    let addr = free_port_addr();
    let daemon = Daemon::start(single_listener_config(&addr), test_logger()).await.unwrap();

    let mut client = SmtpClient::connect(&addr).await;
    let greeting = client.read_reply().await;
    assert!(greeting.starts_with("220"));
    // "<hostname> SMTP Guerrilla #<id> (<active>) <RFC3339 timestamp>" (§4.G)
    assert!(greeting.contains('T') && greeting.trim_end().ends_with('Z'));

    client.send("EHLO sender.example").await;
    assert!(client.read_reply().await.starts_with("250"));

    client.send("MAIL FROM:<alice@sender.example>").await;
    assert!(client.read_reply().await.starts_with("250"));

    client.send("RCPT TO:<bob@example.test>").await;
    assert!(client.read_reply().await.starts_with("250"));

    client.send("DATA").await;
    assert!(client.read_reply().await.starts_with("354"));

    client.send("Subject: hello\r\n\r\nbody text\r\n.").await;
    assert!(client.read_reply().await.starts_with("250"));

    client.send("QUIT").await;
    assert!(client.read_reply().await.starts_with("221"));

    daemon.shutdown().await;
}

#[tokio::test]
async fn rcpt_to_a_disallowed_domain_is_denied() {
    let addr = free_port_addr();
    let mut config = single_listener_config(&addr);
    config.allowed_hosts = vec!["example.test".to_string()];
    let daemon = Daemon::start(config, test_logger()).await.unwrap();

    let mut client = SmtpClient::connect(&addr).await;
    client.read_reply().await;
    client.send("EHLO sender.example").await;
    client.read_reply().await;
    client.send("MAIL FROM:<alice@sender.example>").await;
    client.read_reply().await;

    client.send("RCPT TO:<bob@not-allowed.test>").await;
    let reply = client.read_reply().await;
    assert!(reply.starts_with("554"));
    assert!(reply.contains("Relay access denied"));

    daemon.shutdown().await;
}

#[tokio::test]
async fn too_many_recipients_is_rejected() {
    let addr = free_port_addr();
    let daemon = Daemon::start(single_listener_config(&addr), test_logger()).await.unwrap();

    let mut client = SmtpClient::connect(&addr).await;
    client.read_reply().await;
    client.send("EHLO sender.example").await;
    client.read_reply().await;
    client.send("MAIL FROM:<alice@sender.example>").await;
    client.read_reply().await;

    // `MAX_RECIPIENTS` (pool::envelope) admits a handful before refusing more.
    let mut last_reply = String::new();
    for n in 0..200 {
        client.send(&format!("RCPT TO:<r{n}@example.test>")).await;
        last_reply = client.read_reply().await;
        if last_reply.starts_with("452") {
            break;
        }
    }
    assert!(last_reply.starts_with("452"), "expected 452 eventually, got: {last_reply}");

    daemon.shutdown().await;
}

#[tokio::test]
async fn message_larger_than_max_size_is_rejected() {
    let addr = free_port_addr();
    let mut config = single_listener_config(&addr);
    config.servers[0].max_size = 64;
    let daemon = Daemon::start(config, test_logger()).await.unwrap();

    let mut client = SmtpClient::connect(&addr).await;
    client.read_reply().await;
    client.send("EHLO sender.example").await;
    client.read_reply().await;
    client.send("MAIL FROM:<alice@sender.example>").await;
    client.read_reply().await;
    client.send("RCPT TO:<bob@example.test>").await;
    client.read_reply().await;
    client.send("DATA").await;
    assert!(client.read_reply().await.starts_with("354"));

    let oversized_line = "x".repeat(256);
    client.send(&oversized_line).await;
    client.send(".").await;
    let reply = client.read_reply().await;
    assert!(reply.starts_with("552"));
    assert!(reply.contains("maximum DATA size exceeded"));

    daemon.shutdown().await;
}

#[tokio::test]
async fn nested_mail_from_is_rejected() {
    let addr = free_port_addr();
    let daemon = Daemon::start(single_listener_config(&addr), test_logger()).await.unwrap();

    let mut client = SmtpClient::connect(&addr).await;
    client.read_reply().await;
    client.send("EHLO sender.example").await;
    client.read_reply().await;

    client.send("MAIL FROM:<alice@sender.example>").await;
    assert!(client.read_reply().await.starts_with("250"));

    client.send("MAIL FROM:<alice@sender.example>").await;
    assert!(client.read_reply().await.starts_with("503"));

    daemon.shutdown().await;
}

#[tokio::test]
async fn xclient_updates_envelope_when_enabled() {
    let addr = free_port_addr();
    let mut config = single_listener_config(&addr);
    config.servers[0].xclient_on = true;
    let daemon = Daemon::start(config, test_logger()).await.unwrap();

    let mut client = SmtpClient::connect(&addr).await;
    client.read_reply().await;
    client.send("EHLO proxy.example").await;
    client.read_reply().await;

    client.send("XCLIENT ADDR=203.0.113.9 HELO=real-sender.example").await;
    assert!(client.read_reply().await.starts_with("250"));

    client.send("QUIT").await;
    client.read_reply().await;

    daemon.shutdown().await;
}

#[tokio::test]
async fn starttls_upgrades_the_connection() {
    init_crypto();
    let (cert_pem, key_pem) = generate_cert_and_key();
    let cert_path = write_temp(&cert_pem, "crt");
    let key_path = write_temp(&key_pem, "key");

    let addr = free_port_addr();
    let mut config = single_listener_config(&addr);
    config.servers[0].tls = TlsConfig {
        start_tls_on: true,
        cert_file: cert_path.path().to_string_lossy().to_string(),
        key_file: key_path.path().to_string_lossy().to_string(),
        ..Default::default()
    };
    let daemon = Daemon::start(config, test_logger()).await.unwrap();

    let mut client = SmtpClient::connect(&addr).await;
    client.read_reply().await;
    client.send("EHLO sender.example").await;
    let ehlo_reply = client.read_reply().await;
    assert!(ehlo_reply.starts_with("250"));

    client.send("STARTTLS").await;
    assert!(client.read_reply().await.starts_with("220"));

    // The plain-text reader/writer can't be driven any further once the
    // server has switched to speaking TLS on the same socket; reaching the
    // "220 Ready to start TLS" response is sufficient to exercise the
    // STARTTLS state transition (§4.G `StartTls` state) without pulling in
    // a TLS client stack just for this test.
    daemon.shutdown().await;
}

struct TempFile(std::path::PathBuf);

impl TempFile {
    fn new(contents: &str, suffix: &str) -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut path = std::env::temp_dir();
        path.push(format!("guerrilla-ingest-itest-{}-{n}.{suffix}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        TempFile(path)
    }

    fn path(&self) -> &std::path::Path {
        &self.0
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn write_temp(contents: &str, suffix: &str) -> TempFile {
    TempFile::new(contents, suffix)
}

fn generate_cert_and_key() -> (String, String) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    (cert.cert.pem(), cert.signing_key.serialize_pem())
}
