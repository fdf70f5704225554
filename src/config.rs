//! Configuration management for the Altaro exporter.
//!
//! Supports loading configuration from:
//! - YAML (or TOML) configuration files
//! - Environment variables (with `ALTARO_EXPORTER_` prefix)
//! - Command-line arguments

use crate::error::{AltaroError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Altaro REST API connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct AltaroConfig {
    /// REST API host, with or without scheme (e.g., "https://backup.example.com")
    pub rest_host: String,

    /// REST API port
    #[serde(default = "default_rest_port")]
    pub rest_port: u16,

    /// REST API path prefix
    #[serde(default = "default_rest_path")]
    pub rest_path: String,

    /// Backup server address, as seen from the REST API service
    #[serde(default = "default_server_address")]
    pub server_address: String,

    /// Backup server management port
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Windows domain of the account ("." for local accounts)
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Account name
    #[serde(default)]
    pub username: String,

    /// Account password
    #[serde(default)]
    pub password: String,

    /// Verify TLS certificates (the REST service ships a self-signed one)
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl std::fmt::Debug for AltaroConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AltaroConfig")
            .field("rest_host", &self.rest_host)
            .field("rest_port", &self.rest_port)
            .field("rest_path", &self.rest_path)
            .field("server_address", &self.server_address)
            .field("server_port", &self.server_port)
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"***REDACTED***")
            .field("verify_tls", &self.verify_tls)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl AltaroConfig {
    /// Base URL of the REST API, e.g. `https://localhost:36015/api`.
    pub fn base_url(&self) -> String {
        let host = self.rest_host.trim_end_matches('/');
        let host = if host.contains("://") {
            host.to_string()
        } else {
            format!("https://{}", host)
        };

        let path = self.rest_path.trim_matches('/');
        if path.is_empty() {
            format!("{}:{}", host, self.rest_port)
        } else {
            format!("{}:{}/{}", host, self.rest_port, path)
        }
    }
}

/// HTTP server (scrape endpoint) settings.
#[derive(Clone, Deserialize, Serialize)]
pub struct HttpServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Disable HTTP Basic authentication
    #[serde(default)]
    pub no_auth: bool,

    /// Basic auth username
    #[serde(default)]
    pub username: String,

    /// Basic auth password
    #[serde(default)]
    pub password: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl std::fmt::Debug for HttpServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerConfig")
            .field("listen", &self.listen)
            .field("port", &self.port)
            .field("no_auth", &self.no_auth)
            .field("username", &self.username)
            .field("password", &"***REDACTED***")
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl HttpServerConfig {
    /// Socket address string to bind, e.g. `0.0.0.0:9769`.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen, self.port)
    }
}

/// VM selection options.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct OptionsConfig {
    /// Also list VMs that have no backup configuration
    #[serde(default = "default_true")]
    pub include_unconfigured: bool,

    /// Also export VMs without a next backup or offsite copy scheduled
    #[serde(default = "default_true")]
    pub include_non_scheduled: bool,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            include_unconfigured: true,
            include_non_scheduled: true,
        }
    }
}

/// Main configuration structure for the Altaro exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Altaro REST API configuration
    pub altaro_server: AltaroConfig,

    /// Scrape endpoint configuration
    #[serde(default = "default_http_server")]
    pub http_server: HttpServerConfig,

    /// VM selection options
    #[serde(default)]
    pub options: OptionsConfig,
}

fn default_rest_port() -> u16 {
    36015
}

fn default_rest_path() -> String {
    "/api".to_string()
}

fn default_server_address() -> String {
    "localhost".to_string()
}

fn default_server_port() -> u16 {
    36014
}

fn default_domain() -> String {
    ".".to_string()
}

fn default_verify_tls() -> bool {
    false
}

fn default_timeout() -> u64 {
    30
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9769
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_true() -> bool {
    true
}

fn default_http_server() -> HttpServerConfig {
    HttpServerConfig {
        listen: default_listen(),
        port: default_port(),
        no_auth: false,
        username: String::new(),
        password: String::new(),
        log_level: default_log_level(),
        log_format: default_log_format(),
    }
}

fn config_error(msg: impl Into<String>) -> AltaroError {
    AltaroError::Config(config::ConfigError::Message(msg.into()))
}

impl Settings {
    /// Load configuration from a file and environment variables.
    ///
    /// A path that is given but does not exist is an error; with no path,
    /// only the environment is read.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use altaro_exporter::config::Settings;
    ///
    /// let settings = Settings::load(Some("altaro_exporter.yaml")).unwrap();
    /// ```
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(config_error(format!("Cannot load config file {}", path)));
            }
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment variables with ALTARO_EXPORTER_ prefix,
        // e.g. ALTARO_EXPORTER_ALTARO_SERVER__PASSWORD
        builder = builder.add_source(
            config::Environment::with_prefix("ALTARO_EXPORTER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let settings: Settings = config.try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration settings.
    pub fn validate(&self) -> Result<()> {
        if self.altaro_server.rest_host.trim().is_empty() {
            return Err(config_error("Altaro REST API host cannot be empty"));
        }

        if self.altaro_server.username.is_empty() || self.altaro_server.password.is_empty() {
            return Err(config_error("Altaro API credentials are required"));
        }

        if !self.http_server.no_auth
            && (self.http_server.username.is_empty() || self.http_server.password.is_empty())
        {
            return Err(config_error(
                "HTTP auth credentials are required unless http_server.no_auth is set",
            ));
        }

        match self.http_server.log_format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(config_error(format!("Unknown log format: {}", other))),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            altaro_server: AltaroConfig {
                rest_host: "https://localhost".to_string(),
                rest_port: default_rest_port(),
                rest_path: default_rest_path(),
                server_address: default_server_address(),
                server_port: default_server_port(),
                domain: default_domain(),
                username: String::new(),
                password: String::new(),
                verify_tls: default_verify_tls(),
                timeout_seconds: default_timeout(),
            },
            http_server: default_http_server(),
            options: OptionsConfig::default(),
        }
    }
}
