//! HTTP server for exposing Prometheus metrics.
//!
//! This module provides an Axum-based HTTP server that serves the `/metrics`
//! endpoint for Prometheus scraping, a `/` endpoint with the application
//! name and version, and an unauthenticated `/health` endpoint.

use crate::error::{AltaroError, Result};
use crate::metrics::MetricsCollector;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::Engine;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const APP_NAME: &str = "altaro_exporter";

/// HTTP Basic credentials expected from scrapers.
#[derive(Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Check an `Authorization` header value. Both fields are always
    /// compared, in constant time.
    fn verify(&self, header_value: &str) -> bool {
        let Some(encoded) = header_value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((username, password)) = decoded.split_once(':') else {
            return false;
        };

        let username_ok = username.as_bytes().ct_eq(self.username.as_bytes());
        let password_ok = password.as_bytes().ct_eq(self.password.as_bytes());
        (username_ok & password_ok).into()
    }
}

/// Shared application state.
#[derive(Clone)]
struct AppState {
    metrics: Arc<MetricsCollector>,
    auth: Option<Arc<BasicAuth>>,
}

/// Build the router. `auth = None` serves every request anonymously.
pub fn router(metrics: Arc<MetricsCollector>, auth: Option<BasicAuth>) -> Router {
    if auth.is_none() {
        warn!("Running without HTTP authentication");
    } else {
        info!("Running with HTTP authentication");
    }

    let state = AppState {
        metrics,
        auth: auth.map(Arc::new),
    };

    let authed = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/", get(root_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Liveness probe stays open
    let public = Router::new().route("/health", get(health_handler));

    public
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and run until `shutdown` completes.
///
/// # Examples
///
/// ```no_run
/// use altaro_exporter::client::AltaroClient;
/// use altaro_exporter::config::{OptionsConfig, Settings};
/// use altaro_exporter::metrics::MetricsCollector;
/// use altaro_exporter::server::{router, start_server};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let settings = Settings::load(Some("altaro_exporter.yaml")).unwrap();
///     let client = AltaroClient::new(settings.altaro_server).unwrap();
///     let metrics = Arc::new(MetricsCollector::new(client, OptionsConfig::default()).unwrap());
///     let app = router(metrics, None);
///     start_server("0.0.0.0:9769", app, async {
///         let _ = tokio::signal::ctrl_c().await;
///     })
///     .await
///     .unwrap();
/// }
/// ```
pub async fn start_server<F>(listen_address: &str, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Starting HTTP server on {}", listen_address);

    let listener = TcpListener::bind(listen_address).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| AltaroError::Server(e.to_string()))?;

    Ok(())
}

async fn auth_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(auth) = &state.auth else {
        return next.run(req).await;
    };

    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| auth.verify(v));

    if authorized {
        next.run(req).await
    } else {
        debug!("Rejected unauthenticated request to {}", req.uri().path());
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic")],
            "Incorrect username or password",
        )
            .into_response()
    }
}

/// Handler for /metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    info!("Received metrics scrape request");

    match state.metrics.refresh_and_render().await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Handler for /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}

/// Handler for root endpoint.
async fn root_handler() -> Response {
    Json(json!({
        "app": APP_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}
