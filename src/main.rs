use std::process::ExitCode;

use guerrilla_ingest::config::AppConfig;

/// Default `/health` bind address; independent of the SMTP listeners
/// configured in the JSON config file (§3 supplement).
const DEFAULT_HEALTH_BIND_ADDRESS: &str = "127.0.0.1:8080";

#[tokio::main]
async fn main() -> ExitCode {
    // rustls 0.23 requires a process-level crypto provider before any
    // `ServerConfig`/`ClientConfig` is built (used both by always-on/STARTTLS
    // listeners and the webhook processor's HTTPS client).
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("warning: a rustls crypto provider was already installed");
    }

    let config_path = std::env::args().nth(1);
    let config = match &config_path {
        Some(path) => match AppConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load configuration from {path}: {e:#}");
                return ExitCode::FAILURE;
            }
        },
        None => AppConfig::default(),
    };

    let logger = match guerrilla_ingest::install_logger(&config) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("failed to install logger: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let health_bind_address = std::env::var("GUERRILLA_HEALTH_BIND_ADDRESS")
        .unwrap_or_else(|_| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

    if let Err(e) = guerrilla_ingest::run(config, logger, &health_bind_address).await {
        log::error!("application error: {e:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
