//! # Altaro Exporter
//!
//! A Prometheus metrics exporter for Altaro / Hornetsecurity VM Backup.
//!
//! ## Overview
//!
//! The exporter logs into the Altaro REST API, lists the protected virtual
//! machines on every scrape and exposes, per VM:
//!
//! - Last backup and last offsite copy timestamps
//! - Durations and compressed/uncompressed transfer sizes
//! - Job results (0 = success, 1 = warning, 2 = error, 3 = unknown, 4 = other)
//! - Whether a next job is scheduled
//!
//! plus `altaro_api_success`, the state of the last API call.
//!
//! ## Quick Start
//!
//! ```no_run
//! use altaro_exporter::{client::AltaroClient, config::Settings, metrics::MetricsCollector};
//! use altaro_exporter::server::{router, start_server};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load configuration
//!     let settings = Settings::load(Some("altaro_exporter.yaml"))?;
//!
//!     // Create Altaro client
//!     let client = AltaroClient::new(settings.altaro_server)?;
//!
//!     let metrics = Arc::new(MetricsCollector::new(client, settings.options)?);
//!
//!     // Start HTTP server
//!     let app = router(metrics, None);
//!     start_server(&settings.http_server.listen_address(), app, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! The exporter can be configured via:
//! - YAML configuration file
//! - Environment variables (with `ALTARO_EXPORTER_` prefix)
//! - Command-line arguments
//!
//! See [`config::Settings`] for details.
//!
//! ## Modules
//!
//! - [`session`] - Altaro API session (login/logout)
//! - [`client`] - Altaro API client with one re-authenticated retry
//! - [`mapper`] - Mapping of API VM items to metric values
//! - [`metrics`] - Prometheus metrics definitions and collection
//! - [`server`] - HTTP server for exposing metrics
//! - [`config`] - Configuration management
//! - [`error`] - Error types and handling

pub mod client;
pub mod config;
pub mod error;
pub mod mapper;
pub mod metrics;
pub mod server;
pub mod session;

pub use error::{AltaroError, Result};
