use altaro_exporter::{
    client::AltaroClient,
    config::Settings,
    metrics::MetricsCollector,
    server::{router, start_server, BasicAuth},
};
use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONFIG_FILE: &str = "altaro_exporter.yaml";

/// Altaro Exporter - Prometheus metrics exporter for Altaro VM Backup
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults to ./altaro_exporter.yaml if present)
    #[arg(short, long = "config-file", value_name = "FILE", env = "ALTARO_EXPORTER_CONFIG")]
    config_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    let config_file = args.config_file.or_else(|| {
        Path::new(DEFAULT_CONFIG_FILE)
            .exists()
            .then(|| DEFAULT_CONFIG_FILE.to_string())
    });

    // Load configuration
    let settings = Settings::load(config_file.as_deref())?;

    // Initialize logging
    init_logging(&settings.http_server.log_level, &settings.http_server.log_format);

    info!("Starting Altaro Exporter {}", env!("CARGO_PKG_VERSION"));
    info!("Altaro API: {}", settings.altaro_server.base_url());
    info!("Listen address: {}", settings.http_server.listen_address());

    // Create Altaro client
    let client = AltaroClient::new(settings.altaro_server.clone())?;
    info!("Altaro client initialized");

    // Create metrics collector
    let metrics = Arc::new(MetricsCollector::new(client, settings.options)?);
    metrics.connect().await;
    info!("Metrics collector initialized");

    let auth = (!settings.http_server.no_auth).then(|| {
        BasicAuth::new(
            settings.http_server.username.clone(),
            settings.http_server.password.clone(),
        )
    });
    let app = router(metrics.clone(), auth);

    // Start HTTP server
    info!("Starting HTTP server...");
    let served = start_server(
        &settings.http_server.listen_address(),
        app,
        shutdown_signal(),
    )
    .await;

    // Free the upstream session, otherwise the next login is refused for a while
    metrics.shutdown().await;

    if let Err(e) = served {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Altaro Exporter stopped");
    Ok(())
}

/// Initialize structured logging with tracing.
fn init_logging(log_level: &str, log_format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
