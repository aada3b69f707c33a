//! TLS acceptor construction for STARTTLS and always-on listeners (§4.G
//! `StartTLS` state, §6 TLS sub-block).
//!
//! Grounded in the general rustls-server idiom used across the retrieved
//! corpus's mail daemons (cert/key PEM loaded via `rustls-pemfile`, wrapped
//! in a `tokio_rustls::TlsAcceptor`) — the teacher itself only speaks TLS as
//! an HTTPS *client* (`hyper-rustls`, in `backend::processors::WebhookProcessor`),
//! so the server side is an enrichment from the wider pack rather than a
//! direct port of teacher code.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rustls::crypto::aws_lc_rs;
use rustls::crypto::{CryptoProvider, SupportedKxGroup};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{NamedGroup, RootCertStore, SupportedCipherSuite, SupportedProtocolVersion};
use tokio_rustls::TlsAcceptor;

use crate::config::{ClientAuthMode, TlsConfig};

/// Builds a `TlsAcceptor` from a validated [`TlsConfig`], applying
/// `protocols`/`ciphers`/`curves` (§6 TLS sub-block) through a
/// per-listener [`CryptoProvider`] rather than letting them sit as
/// parsed-but-inert fields. Called both at server start and whenever a
/// `ServerTLSConfig` event signals a cert/key rotation (§4.I).
pub fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = load_certs(&config.cert_file)?;
    let key = load_private_key(&config.key_file)?;

    let provider = build_crypto_provider(config)?;
    let protocol_versions = resolve_protocol_versions(&config.protocols)?;

    let builder = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&protocol_versions)
        .context("no usable TLS protocol version/cipher suite combination")?;

    // rustls's `WebPkiClientVerifier` always chain-validates any cert it's
    // given; there's no "require a cert but skip verification" mode, so
    // `RequireAnyClientCert` is approximated by the same required-and-
    // verified verifier as `RequireAndVerifyClientCert`. `RequestClientCert`
    // and `VerifyClientCertIfGiven` both mean "don't require a cert, but
    // verify one if the client sends it" — `allow_unauthenticated()` is
    // what makes the cert optional instead of mandatory.
    let builder = match config.client_auth_type {
        ClientAuthMode::NoClientCert => builder.with_no_client_auth(),
        ClientAuthMode::RequestClientCert | ClientAuthMode::VerifyClientCertIfGiven => {
            let roots = load_client_root_store(config)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .context("failed to build client certificate verifier")?;
            builder.with_client_cert_verifier(verifier)
        }
        ClientAuthMode::RequireAnyClientCert | ClientAuthMode::RequireAndVerifyClientCert => {
            let roots = load_client_root_store(config)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .context("failed to build client certificate verifier")?;
            builder.with_client_cert_verifier(verifier)
        }
    };

    let mut server_config = builder
        .with_single_cert(certs, key)
        .context("invalid certificate/key pair")?;

    server_config.ignore_client_order = config.prefer_server_cipher_suites;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Validates the `protocols`/`ciphers`/`curves` fields of a [`TlsConfig`]
/// without needing certs on disk, so `AppConfig::validate` (§6) can reject
/// a malformed TLS block at config-load time instead of at first accept.
pub fn validate_tls_fields(config: &TlsConfig) -> Result<()> {
    resolve_protocol_versions(&config.protocols)?;
    let provider = aws_lc_rs::default_provider();
    resolve_cipher_suites(&config.ciphers, &provider)?;
    resolve_kx_groups(&config.curves, &provider)?;
    Ok(())
}

/// Builds a `CryptoProvider` restricted to the configured `ciphers`/
/// `curves`, falling back to the full `aws_lc_rs` default set for either
/// field left empty.
fn build_crypto_provider(config: &TlsConfig) -> Result<CryptoProvider> {
    let base = aws_lc_rs::default_provider();
    let cipher_suites = resolve_cipher_suites(&config.ciphers, &base)?;
    let kx_groups = resolve_kx_groups(&config.curves, &base)?;
    Ok(CryptoProvider {
        cipher_suites,
        kx_groups,
        ..base
    })
}

/// Maps `tls1.0|tls1.1|tls1.2` (§6) onto the protocol versions rustls
/// actually implements. rustls deliberately never implemented TLS 1.0/1.1
/// (both are deprecated, RFC 8996), so those two names fail validation
/// with an explicit error rather than silently downgrading to 1.2.
fn resolve_protocol_versions(names: &[String]) -> Result<Vec<&'static SupportedProtocolVersion>> {
    if names.is_empty() {
        return Ok(rustls::ALL_VERSIONS.to_vec());
    }
    names.iter().map(|name| match name.to_ascii_lowercase().as_str() {
        "tls1.2" => Ok(&rustls::version::TLS12),
        "tls1.3" => Ok(&rustls::version::TLS13),
        "tls1.0" | "tls1.1" => Err(anyhow!(
            "TLS protocol '{name}' is not implemented by rustls (only tls1.2/tls1.3 are supported)"
        )),
        other => Err(anyhow!("unrecognized TLS protocol '{other}'")),
    }).collect()
}

/// Matches configured IANA cipher suite names (§6) against the names
/// `SupportedCipherSuite::suite()`'s `Debug` output actually produces
/// (e.g. `TLS13_AES_128_GCM_SHA256`), which line up with the IANA registry
/// names modulo casing.
fn resolve_cipher_suites(names: &[String], provider: &CryptoProvider) -> Result<Vec<SupportedCipherSuite>> {
    if names.is_empty() {
        return Ok(provider.cipher_suites.clone());
    }
    names
        .iter()
        .map(|name| {
            provider
                .cipher_suites
                .iter()
                .find(|suite| cipher_suite_name(suite).eq_ignore_ascii_case(name))
                .copied()
                .ok_or_else(|| anyhow!("unrecognized or unsupported cipher suite '{name}'"))
        })
        .collect()
}

fn cipher_suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

/// Maps `P256|P384|P521` (§6) onto rustls's `NamedGroup`s and resolves them
/// against the provider's actually-available key-exchange groups.
fn resolve_kx_groups(
    names: &[String],
    provider: &CryptoProvider,
) -> Result<Vec<&'static dyn SupportedKxGroup>> {
    if names.is_empty() {
        return Ok(provider.kx_groups.clone());
    }
    names
        .iter()
        .map(|name| {
            let named_group = match name.to_ascii_uppercase().as_str() {
                "P256" => NamedGroup::secp256r1,
                "P384" => NamedGroup::secp384r1,
                "P521" => NamedGroup::secp521r1,
                other => return Err(anyhow!("unrecognized curve '{other}' (expected P256, P384, or P521)")),
            };
            provider
                .kx_groups
                .iter()
                .find(|group| group.name() == named_group)
                .copied()
                .ok_or_else(|| anyhow!("curve '{name}' is not supported by the installed crypto provider"))
        })
        .collect()
}

fn load_client_root_store(config: &TlsConfig) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    if let Some(path) = &config.root_cas {
        for cert in load_certs(path)? {
            store
                .add(cert)
                .context("failed to add client CA certificate to trust store")?;
        }
    }
    Ok(store)
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("failed to open cert file {path}"))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates in {path}"))
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("failed to open key file {path}"))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("failed to parse private key in {path}"))?
        .ok_or_else(|| anyhow!("no private key found in {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct TempFile(std::path::PathBuf);

    impl TempFile {
        fn new(contents: &str, suffix: &str) -> Self {
            use std::sync::atomic::{AtomicU64, Ordering};
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            let mut path = std::env::temp_dir();
            path.push(format!("guerrilla-ingest-test-{}-{n}.{suffix}", std::process::id()));
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(contents.as_bytes()).unwrap();
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
        (
            cert.cert.pem(),
            cert.signing_key.serialize_pem(),
        )
    }

    /// `rustls` 0.23 requires a process-level crypto provider installed
    /// before any `ServerConfig` is built; harmless to call more than once.
    fn init_crypto() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }

    #[test]
    fn builds_acceptor_from_self_signed_cert() {
        init_crypto();
        let (cert_pem, key_pem) = generate_cert_and_key();
        let cert_path = write_temp(&cert_pem, "crt");
        let key_path = write_temp(&key_pem, "key");

        let config = TlsConfig {
            always_on: true,
            cert_file: cert_path.path().to_string_lossy().to_string(),
            key_file: key_path.path().to_string_lossy().to_string(),
            ..Default::default()
        };

        assert!(build_acceptor(&config).is_ok());
    }

    #[test]
    fn missing_cert_file_is_an_error() {
        let config = TlsConfig {
            always_on: true,
            cert_file: "/nonexistent/cert.pem".to_string(),
            key_file: "/nonexistent/key.pem".to_string(),
            ..Default::default()
        };
        assert!(build_acceptor(&config).is_err());
    }
}
