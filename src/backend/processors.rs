//! Built-in processors registrable by name in a `save_process` /
//! `validate_process` chain (§4.H, §9). These are deliberately thin —
//! illustrative collaborators that exercise the chain mechanism, not a
//! production storage/header-parsing library.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::Request as HttpRequest;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::BackendConfig;
use crate::pool::Envelope;

use super::{GatewayResult, Next, Processor, Task};

/// Builds a registered processor by name, reading any processor-scoped
/// configuration it needs from `config.extra` (§9: "Processor-specific keys
/// are scoped by processor name").
pub fn build(name: &str, config: &BackendConfig) -> Result<Arc<dyn Processor>, String> {
    match name {
        "HeadersParser" => Ok(Arc::new(HeadersParser)),
        "Header" => Ok(Arc::new(Header)),
        "Debugger" => Ok(Arc::new(Debugger {
            log_full: config.log_received_mails,
        })),
        "Hasher" => Ok(Arc::new(Hasher)),
        "Webhook" => Ok(Arc::new(WebhookProcessor::new(config))),
        other => Err(format!("unknown processor '{other}'")),
    }
}

/// Validates that the raw message has a header/body boundary before the
/// rest of the chain tries to parse it. A stand-in for the teacher's
/// `email_parser` boundary check, generalized to a chain step instead of a
/// hardcoded call site.
pub struct HeadersParser;

#[async_trait]
impl Processor for HeadersParser {
    fn name(&self) -> &'static str {
        "HeadersParser"
    }

    async fn process(
        &self,
        envelope: &mut Envelope,
        task: Task,
        next: Next<'_>,
    ) -> Result<GatewayResult> {
        if task == Task::SaveMail && header_body_split(&envelope.data).is_none() {
            return Err(anyhow!("message has no header/body boundary"));
        }
        next.call(envelope, task).await
    }
}

/// Parses RFC 5322 style headers (unfolding continuation lines) into
/// `envelope.header`.
pub struct Header;

#[async_trait]
impl Processor for Header {
    fn name(&self) -> &'static str {
        "Header"
    }

    async fn process(
        &self,
        envelope: &mut Envelope,
        task: Task,
        next: Next<'_>,
    ) -> Result<GatewayResult> {
        if task == Task::SaveMail {
            if let Some((raw_headers, _)) = header_body_split(&envelope.data) {
                for (key, value) in parse_headers(raw_headers) {
                    envelope.header.entry(key).or_default().push(value);
                }
            }
        }
        next.call(envelope, task).await
    }
}

/// Splits `data` into `(raw_headers, body)` at the first blank line,
/// tolerating both `\r\n\r\n` and bare `\n\n` boundaries.
fn header_body_split(data: &[u8]) -> Option<(&[u8], &[u8])> {
    if let Some(pos) = find_subslice(data, b"\r\n\r\n") {
        return Some((&data[..pos], &data[pos + 4..]));
    }
    find_subslice(data, b"\n\n").map(|pos| (&data[..pos], &data[pos + 2..]))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_headers(raw: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(raw);
    let mut headers = Vec::new();

    for line in text.split("\r\n").flat_map(|l| l.split('\n')) {
        if line.is_empty() {
            continue;
        }
        if (line.starts_with(' ') || line.starts_with('\t')) && !headers.is_empty() {
            let last: &mut (String, String) = headers.last_mut().unwrap();
            last.1.push(' ');
            last.1.push_str(line.trim());
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    headers
}

/// Logs the envelope at debug level, either in full or as a one-line
/// summary depending on `log_received_mails` (§3 supplement).
pub struct Debugger {
    log_full: bool,
}

#[async_trait]
impl Processor for Debugger {
    fn name(&self) -> &'static str {
        "Debugger"
    }

    async fn process(
        &self,
        envelope: &mut Envelope,
        task: Task,
        next: Next<'_>,
    ) -> Result<GatewayResult> {
        if self.log_full {
            log::debug!(
                "envelope {} task={:?} from={:?} rcpt={:?} headers={:?} data_len={}",
                envelope.queued_id,
                task,
                envelope.mail_from,
                envelope.rcpt_to,
                envelope.header,
                envelope.data.len(),
            );
        } else {
            log::debug!(
                "envelope {} task={:?} rcpt_count={} data_len={}",
                envelope.queued_id,
                task,
                envelope.rcpt_to.len(),
                envelope.data.len(),
            );
        }
        next.call(envelope, task).await
    }
}

/// Stamps a content hash into the header map, useful as a cheap dedup key
/// for a downstream store.
pub struct Hasher;

#[async_trait]
impl Processor for Hasher {
    fn name(&self) -> &'static str {
        "Hasher"
    }

    async fn process(
        &self,
        envelope: &mut Envelope,
        task: Task,
        next: Next<'_>,
    ) -> Result<GatewayResult> {
        if task == Task::SaveMail {
            let digest = Sha256::digest(&envelope.data);
            envelope
                .header
                .insert("X-Content-Hash".to_string(), vec![hex::encode(digest)]);
        }
        next.call(envelope, task).await
    }
}

/// The payload posted to the configured webhook URL, modeled on the
/// teacher's `webhook::EmailPayload`.
#[derive(Debug, Clone, Serialize)]
struct EnvelopePayload {
    sender: String,
    recipients: Vec<String>,
    subject: String,
    headers: std::collections::HashMap<String, Vec<String>>,
    content_hash: Option<String>,
}

type WebhookHttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Forwards the envelope to an HTTPS webhook, adapted from the teacher's
/// `WebhookClient` into one pluggable chain step instead of the only
/// backend.
pub struct WebhookProcessor {
    url: Option<String>,
    client: WebhookHttpClient,
    user_agent: String,
}

impl WebhookProcessor {
    fn new(config: &BackendConfig) -> Self {
        let url = config
            .extra
            .get("webhook_url")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("failed to load native root certificates for hyper-rustls")
            .https_only()
            .enable_http1()
            .build();
        let client: WebhookHttpClient = Client::builder(TokioExecutor::new()).build(https);
        let user_agent = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

        WebhookProcessor { url, client, user_agent }
    }
}

#[async_trait]
impl Processor for WebhookProcessor {
    fn name(&self) -> &'static str {
        "Webhook"
    }

    async fn process(
        &self,
        envelope: &mut Envelope,
        task: Task,
        next: Next<'_>,
    ) -> Result<GatewayResult> {
        if task == Task::SaveMail {
            let Some(url) = self.url.as_deref() else {
                return Err(anyhow!("Webhook processor configured without webhook_url"));
            };

            let payload = EnvelopePayload {
                sender: envelope
                    .mail_from
                    .as_ref()
                    .map(|a| format!("{}@{}", a.local_part, a.domain))
                    .unwrap_or_default(),
                recipients: envelope
                    .rcpt_to
                    .iter()
                    .map(|a| format!("{}@{}", a.local_part, a.domain))
                    .collect(),
                subject: envelope
                    .header
                    .get("Subject")
                    .and_then(|v| v.first())
                    .cloned()
                    .unwrap_or_default(),
                headers: envelope.header.clone(),
                content_hash: envelope
                    .header
                    .get("X-Content-Hash")
                    .and_then(|v| v.first())
                    .cloned(),
            };

            let json_body = serde_json::to_string(&payload)?;
            let request = HttpRequest::builder()
                .method(hyper::Method::POST)
                .uri(url)
                .header("content-type", "application/json")
                .header("user-agent", &self.user_agent)
                .body(Full::new(Bytes::from(json_body)))?;

            let response = self.client.request(request).await?;
            let status = response.status();
            if !status.is_success() {
                log::error!("webhook request to {url} failed with status: {status}");
                return Err(anyhow!("webhook responded with status {status}"));
            }
            log::info!("envelope {} forwarded to webhook {url}", envelope.queued_id);
        }

        next.call(envelope, task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_and_folded_headers() {
        let raw = b"Subject: hi\r\nX-Long: part one\r\n continued\r\n";
        let headers = parse_headers(raw);
        assert_eq!(headers[0], ("Subject".to_string(), "hi".to_string()));
        assert_eq!(headers[1].1, "part one continued");
    }

    #[test]
    fn header_body_split_finds_crlf_boundary() {
        let data = b"Subject: hi\r\n\r\nbody text";
        let (headers, body) = header_body_split(data).unwrap();
        assert_eq!(headers, b"Subject: hi");
        assert_eq!(body, b"body text");
    }

    #[tokio::test]
    async fn headers_parser_rejects_message_without_boundary() {
        let mut envelope = Envelope {
            data: b"not a valid message".to_vec(),
            ..Default::default()
        };
        let chain: Vec<Arc<dyn Processor>> = vec![Arc::new(HeadersParser)];
        let result = Next { remaining: &chain }.call(&mut envelope, Task::SaveMail).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn hasher_populates_content_hash_header() {
        let mut envelope = Envelope {
            data: b"Subject: hi\r\n\r\nbody".to_vec(),
            ..Default::default()
        };
        let chain: Vec<Arc<dyn Processor>> = vec![Arc::new(Hasher)];
        Next { remaining: &chain }
            .call(&mut envelope, Task::SaveMail)
            .await
            .unwrap();
        assert!(envelope.header.contains_key("X-Content-Hash"));
    }
}
