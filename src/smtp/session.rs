//! The per-connection SMTP state machine (§4.G).
//!
//! Generalizes the teacher's `SmtpProtocol<R, W>` (HELO/MAIL FROM/RCPT
//! TO/DATA over a fixed five-state machine feeding a single hardcoded
//! target address) into the full Greeting/Cmd/Data/StartTLS/Shutdown
//! machine dispatching through the backend gateway and allowed-hosts
//! matcher instead of a single string comparison.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::time::timeout;

use crate::backend::{Gateway, GatewayError};
use crate::config::ServerConfig;
use crate::pool::{Envelope, EnvelopePool, MAX_RECIPIENTS};
use crate::protocol::{self, parse_path, AllowedHosts, BoundedReader, ReadLineError};
use crate::tls;

use super::stream::Stream;

/// §4.G's named states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Greeting,
    Cmd,
    Data,
    StartTls,
    Shutdown,
}

/// Maximum consecutive unrecognized commands before the connection is
/// terminated (§4.G "after 5 consecutive unknowns").
const MAX_CONSECUTIVE_UNKNOWN: u32 = 5;

type Io = BoundedReader<BufStream<Stream>>;

pub struct Session {
    /// `None` only for the brief moment `STARTTLS` is swapping the socket.
    io: Option<Io>,
    state: ClientState,
    envelope: Box<Envelope>,
    connection_id: u64,
    active_connections: usize,
    config: ServerConfig,
    allowed_hosts: Arc<AllowedHosts>,
    gateway: Arc<Gateway>,
    envelope_pool: Arc<EnvelopePool>,
    shutting_down: Arc<AtomicBool>,
    tls_active: bool,
    unknown_count: u32,
    message_count: u32,
    terminate: bool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: Stream,
        envelope: Box<Envelope>,
        connection_id: u64,
        active_connections: usize,
        config: ServerConfig,
        allowed_hosts: Arc<AllowedHosts>,
        gateway: Arc<Gateway>,
        envelope_pool: Arc<EnvelopePool>,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        let tls_active = stream.is_tls();
        let buffered = BufStream::new(stream);
        Session {
            io: Some(BoundedReader::new(buffered, protocol::MAX_COMMAND_LINE_LEN)),
            state: ClientState::Greeting,
            envelope,
            connection_id,
            active_connections,
            config,
            allowed_hosts,
            gateway,
            envelope_pool,
            shutting_down,
            tls_active,
            unknown_count: 0,
            message_count: 0,
            terminate: false,
        }
    }

    fn io(&mut self) -> &mut Io {
        self.io.as_mut().expect("session io missing outside STARTTLS upgrade")
    }

    /// Drives the connection from greeting to close, returning the envelope
    /// for release back to the pool.
    pub async fn run(mut self) -> Result<Box<Envelope>> {
        loop {
            match self.state {
                ClientState::Greeting => self.send_greeting().await?,
                ClientState::Cmd => self.read_and_dispatch().await?,
                ClientState::Data => self.read_data().await?,
                ClientState::StartTls => self.upgrade_to_tls().await?,
                ClientState::Shutdown => {
                    self.reply(421, "4.3.0 server shutting down, try later").await?;
                    self.terminate = true;
                }
            }

            if self.terminate {
                break;
            }
        }

        let _ = self.io().inner_mut().flush().await;
        Ok(self.envelope)
    }

    fn timeout_duration(&self) -> Duration {
        self.config.timeout_duration()
    }

    async fn reply(&mut self, code: u16, message: &str) -> Result<()> {
        let line = format!("{code} {message}\r\n");
        let deadline = self.timeout_duration();
        timeout(deadline, self.io().inner_mut().write_all(line.as_bytes())).await??;
        timeout(deadline, self.io().inner_mut().flush()).await??;
        Ok(())
    }

    async fn reply_multiline(&mut self, code: u16, lines: &[String]) -> Result<()> {
        let mut out = String::new();
        for (i, line) in lines.iter().enumerate() {
            let sep = if i + 1 == lines.len() { ' ' } else { '-' };
            out.push_str(&format!("{code}{sep}{line}\r\n"));
        }
        let deadline = self.timeout_duration();
        timeout(deadline, self.io().inner_mut().write_all(out.as_bytes())).await??;
        timeout(deadline, self.io().inner_mut().flush()).await??;
        Ok(())
    }

    async fn send_greeting(&mut self) -> Result<()> {
        let now = rfc3339_timestamp_now();
        self.reply(
            220,
            &format!(
                "{} SMTP Guerrilla #{} ({}) {now}",
                self.config.hostname, self.connection_id, self.active_connections
            ),
        )
        .await?;
        self.state = ClientState::Cmd;
        Ok(())
    }

    async fn read_and_dispatch(&mut self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            self.state = ClientState::Shutdown;
            return Ok(());
        }

        self.io().set_limit(protocol::MAX_COMMAND_LINE_LEN);
        let deadline = self.timeout_duration();
        let line = match timeout(deadline, self.io().read_line()).await {
            Ok(Ok(line)) => line,
            Ok(Err(ReadLineError::LimitExceeded)) => {
                self.reply(500, "5.5.4 line too long").await?;
                self.terminate = true;
                return Ok(());
            }
            Ok(Err(ReadLineError::Io(_))) | Err(_) => {
                self.terminate = true;
                return Ok(());
            }
        };

        if line.is_empty() {
            self.terminate = true;
            return Ok(());
        }

        let line = String::from_utf8_lossy(&line).to_string();
        self.dispatch(&line).await
    }

    async fn dispatch(&mut self, line: &str) -> Result<()> {
        let (verb, rest) = split_verb(line);
        let verb_upper = verb.to_ascii_uppercase();

        if verb_upper.len() > protocol::MAX_VERB_LEN {
            return self.unknown_command().await;
        }

        match verb_upper.as_str() {
            "HELO" => self.cmd_helo(rest.trim()).await,
            "EHLO" => self.cmd_ehlo(rest.trim()).await,
            "HELP" => {
                self.reply_multiline(214, &["OK".to_string(), "\"supported commands\"".to_string()])
                    .await
            }
            "XCLIENT" => self.cmd_xclient(rest).await,
            "MAIL" if rest.trim_start().to_ascii_uppercase().starts_with("FROM:") => {
                self.cmd_mail_from(strip_prefix_ci(rest.trim_start(), "FROM:")).await
            }
            "RCPT" if rest.trim_start().to_ascii_uppercase().starts_with("TO:") => {
                self.cmd_rcpt_to(strip_prefix_ci(rest.trim_start(), "TO:")).await
            }
            "RSET" => {
                self.envelope.reset_transaction();
                self.reply(250, "2.0.0 OK").await
            }
            "VRFY" => self.reply(252, "2.1.5 cannot verify, but will accept message").await,
            "NOOP" => self.reply(250, "2.0.0 OK").await,
            "QUIT" => {
                self.reply(221, "2.0.0 Bye").await?;
                self.terminate = true;
                Ok(())
            }
            "DATA" => self.cmd_data().await,
            "STARTTLS" => self.cmd_starttls().await,
            _ => self.unknown_command().await,
        }
    }

    async fn unknown_command(&mut self) -> Result<()> {
        self.unknown_count += 1;
        if self.unknown_count >= MAX_CONSECUTIVE_UNKNOWN {
            self.reply(500, "5.5.1 too many unrecognized commands").await?;
            self.terminate = true;
            Ok(())
        } else {
            self.reply(500, "5.5.1 unrecognized command").await
        }
    }

    async fn cmd_helo(&mut self, domain: &str) -> Result<()> {
        self.envelope.reset_transaction();
        self.envelope.helo = domain.to_string();
        self.reply(250, &format!("{} Hello", self.config.hostname)).await
    }

    async fn cmd_ehlo(&mut self, domain: &str) -> Result<()> {
        self.envelope.reset_transaction();
        self.envelope.helo = domain.to_string();

        let mut lines = vec![
            format!("{} Hello", self.config.hostname),
            format!("SIZE {}", self.config.max_size),
            "PIPELINING".to_string(),
        ];
        if self.config.tls.start_tls_on && !self.tls_active {
            lines.push("STARTTLS".to_string());
        }
        lines.push("ENHANCEDSTATUSCODES".to_string());
        lines.push("HELP".to_string());

        self.reply_multiline(250, &lines).await
    }

    async fn cmd_xclient(&mut self, rest: &str) -> Result<()> {
        if !self.config.xclient_on {
            return self.unknown_command().await;
        }

        for token in rest.split_whitespace() {
            if let Some(value) = token.strip_prefix("ADDR=") {
                if value != "[UNAVAILABLE]" {
                    self.envelope.remote_ip = value.to_string();
                }
            } else if let Some(value) = token.strip_prefix("HELO=") {
                if value != "[UNAVAILABLE]" {
                    self.envelope.helo = value.to_string();
                }
            }
        }

        self.reply(250, "2.0.0 OK").await
    }

    async fn cmd_mail_from(&mut self, arg: &str) -> Result<()> {
        if self.envelope.is_in_transaction() {
            return self.reply(503, "5.5.1 nested MAIL command").await;
        }

        match parse_path(arg, true) {
            Ok(address) => {
                self.envelope.mail_from = Some(address);
                self.reply(250, "2.1.0 OK").await
            }
            Err(e) => self.reply(501, &format!("5.1.7 {e}")).await,
        }
    }

    async fn cmd_rcpt_to(&mut self, arg: &str) -> Result<()> {
        if self.envelope.rcpt_to.len() >= MAX_RECIPIENTS {
            return self.reply(452, "4.5.3 too many recipients").await;
        }

        let address = match parse_path(arg, false) {
            Ok(address) => address,
            Err(e) => return self.reply(501, &format!("5.1.3 {e}")).await,
        };

        if !self.allowed_hosts.is_allowed(&address.domain) {
            return self.reply(554, "5.7.1 Relay access denied").await;
        }

        self.envelope.rcpt_to.push(address);
        let envelope = std::mem::take(&mut *self.envelope);
        let (envelope, result) = self.gateway.validate_rcpt(envelope).await;
        *self.envelope = envelope;

        match result {
            Ok(()) => self.reply(250, "2.1.5 OK").await,
            Err(err) => {
                self.envelope.rcpt_to.pop();
                self.reply_for_gateway_error(&err).await
            }
        }
    }

    async fn reply_for_gateway_error(&mut self, err: &GatewayError) -> Result<()> {
        match err {
            GatewayError::TransactionTimeout => self.reply(450, "4.3.0 transaction timeout").await,
            GatewayError::StorageFailed(reason) => {
                self.reply(450, &format!("4.3.0 storage failed: {reason}")).await
            }
            GatewayError::Shuttered => self.reply(421, "4.3.0 backend unavailable").await,
        }
    }

    async fn cmd_data(&mut self) -> Result<()> {
        if self.envelope.rcpt_to.is_empty() {
            return self.reply(503, "5.5.1 need RCPT before DATA").await;
        }
        self.reply(354, "Enter message, ending with \".\" on a line by itself").await?;
        self.state = ClientState::Data;
        Ok(())
    }

    async fn read_data(&mut self) -> Result<()> {
        let ceiling = (self.config.max_size as usize).saturating_add(protocol::DATA_READ_CEILING_SLACK);
        self.io().set_limit(ceiling);

        let mut data = Vec::new();
        let mut exceeded = false;
        let deadline = self.timeout_duration();

        loop {
            let line = match timeout(deadline, self.io().read_line()).await {
                Ok(Ok(line)) => line,
                Ok(Err(ReadLineError::LimitExceeded)) => {
                    exceeded = true;
                    break;
                }
                Ok(Err(ReadLineError::Io(_))) | Err(_) => {
                    self.terminate = true;
                    return Ok(());
                }
            };

            if line == b"." {
                break;
            }

            // Standard SMTP dot-unstuffing: a leading ".." becomes ".".
            if line.starts_with(b"..") {
                data.extend_from_slice(&line[1..]);
            } else {
                data.extend_from_slice(&line);
            }
            data.extend_from_slice(b"\r\n");

            if data.len() as u64 > self.config.max_size {
                exceeded = true;
            }
        }

        if exceeded || data.len() as u64 > self.config.max_size {
            self.reply(552, "5.3.4 maximum DATA size exceeded").await?;
            self.terminate = true;
            return Ok(());
        }

        self.envelope.data = data;
        self.envelope.queued_id = self.envelope_pool.next_queued_id();

        let envelope = std::mem::take(&mut *self.envelope);
        let (envelope, result) = self.gateway.process(envelope).await;
        *self.envelope = envelope;

        match result {
            Ok(gateway_result) => {
                if gateway_result.is_success() {
                    self.message_count += 1;
                }
                let code = gateway_result.code;
                let message = gateway_result.message.clone();
                self.reply(code, &message).await?;
            }
            Err(err) => self.reply_for_gateway_error(&err).await?,
        }

        self.envelope.reset_transaction();
        self.state = if self.shutting_down.load(Ordering::SeqCst) {
            ClientState::Shutdown
        } else {
            ClientState::Cmd
        };
        Ok(())
    }

    async fn cmd_starttls(&mut self) -> Result<()> {
        if !self.config.tls.start_tls_on || self.tls_active {
            return self.unknown_command().await;
        }
        self.reply(220, "2.0.0 Ready to start TLS").await?;
        self.state = ClientState::StartTls;
        Ok(())
    }

    /// Wraps the plain socket in a TLS server stream in place. Takes the
    /// buffered IO out of `self.io` (leaving it briefly `None`) since the
    /// plain `TcpStream` has to be unwrapped from its buffers before the
    /// handshake and a new `BufStream` built around the upgraded transport.
    async fn upgrade_to_tls(&mut self) -> Result<()> {
        let acceptor = match tls::build_acceptor(&self.config.tls) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                log::warn!("connection {}: failed to build TLS acceptor: {e}", self.connection_id);
                self.state = ClientState::Cmd;
                return Ok(());
            }
        };

        let io = self.io.take().expect("session io missing outside STARTTLS upgrade");
        let stream = io.into_inner().into_inner();

        let Stream::Plain(tcp) = stream else {
            return Err(anyhow!("STARTTLS requested on an already-TLS socket"));
        };

        match acceptor.accept(tcp).await {
            Ok(tls_stream) => {
                self.io = Some(BoundedReader::new(
                    BufStream::new(Stream::Tls(Box::new(tls_stream))),
                    protocol::MAX_COMMAND_LINE_LEN,
                ));
                self.tls_active = true;
                self.envelope.tls = true;
                self.envelope.reset_transaction();
                self.state = ClientState::Cmd;
            }
            Err(e) => {
                log::warn!("connection {}: TLS handshake failed: {e}", self.connection_id);
                // The plain TCP stream was consumed by the failed handshake
                // attempt; nothing left to fall back to but closing up.
                self.terminate = true;
            }
        }
        Ok(())
    }
}

fn split_verb(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(pos) => (&line[..pos], &line[pos..]),
        None => (line, ""),
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> &'a str {
    &s[prefix.len().min(s.len())..]
}

/// An RFC3339 UTC timestamp (`YYYY-MM-DDTHH:MM:SSZ`) for the greeting banner
/// (§4.G), hand-rolled from `SystemTime` since no date/time crate is in the
/// dependency tree (the teacher pack formats timestamps without one too; see
/// `logging::humantime_timestamp`).
fn rfc3339_timestamp_now() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    let days = (secs / 86_400) as i64;
    let time_of_day = secs % 86_400;
    let (hour, minute, second) = (time_of_day / 3600, (time_of_day / 60) % 60, time_of_day % 60);
    let (year, month, day) = civil_from_days(days);
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}Z")
}

/// Days-since-epoch to Gregorian civil date, per Howard Hinnant's
/// `civil_from_days` (public-domain "chrono-Compatible Low-Level Date
/// Algorithms"). Valid for the entire range representable by `i64` days.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}
