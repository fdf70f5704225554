//! Altaro API client for listing virtual machines.
//!
//! This module provides a client for the Altaro VM Backup REST API. Every
//! read goes through the [`SessionManager`]; a failed read is retried once
//! after a fresh logout/login when the failure looks like a dropped
//! connection or an expired token.

use crate::config::AltaroConfig;
use crate::error::{AltaroError, Result};
use crate::mapper::{self, VmRecord};
use crate::session::SessionManager;
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of the last API call, exported as `altaro_api_success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiHealth {
    /// Last call succeeded
    Healthy,
    /// Could not reach the API, even after a retry
    CannotConnect,
    /// The API answered with an error
    ApiError,
}

impl ApiHealth {
    /// Gauge value.
    pub fn code(self) -> f64 {
        match self {
            ApiHealth::Healthy => 0.0,
            ApiHealth::CannotConnect => 1.0,
            ApiHealth::ApiError => 2.0,
        }
    }

    fn for_failure(first_error: &AltaroError) -> Self {
        match first_error {
            AltaroError::Transport(_) => ApiHealth::CannotConnect,
            _ => ApiHealth::ApiError,
        }
    }
}

/// Altaro API client.
pub struct AltaroClient {
    http: Client,
    base_url: String,
    session: SessionManager,
    health: ApiHealth,
}

impl AltaroClient {
    /// Create a new Altaro API client. No request is sent until the first call.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use altaro_exporter::client::AltaroClient;
    /// use altaro_exporter::config::Settings;
    ///
    /// let mut config = Settings::default().altaro_server;
    /// config.rest_host = "https://backup.example.com".to_string();
    /// config.username = "Administrator".to_string();
    /// config.password = "secret".to_string();
    /// let client = AltaroClient::new(config).unwrap();
    /// ```
    pub fn new(config: AltaroConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        Ok(Self {
            session: SessionManager::new(http.clone(), &config),
            base_url: config.base_url(),
            http,
            health: ApiHealth::Healthy,
        })
    }

    /// Health of the last [`list_vms`](Self::list_vms) call.
    pub fn health(&self) -> ApiHealth {
        self.health
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Open a session now instead of on the first listing.
    pub async fn login(&mut self) -> Result<()> {
        self.session.login().await
    }

    /// Close the current session, if any.
    pub async fn logout(&mut self) {
        self.session.logout().await
    }

    /// List VMs and map them to metric records.
    ///
    /// A transport failure or an invalid token triggers exactly one
    /// logout/login cycle and one more attempt. Any other API error is
    /// returned as is.
    pub async fn list_vms(
        &mut self,
        include_unconfigured: bool,
        include_non_scheduled: bool,
    ) -> Result<Vec<VmRecord>> {
        let outcome = match self.fetch_vms(include_unconfigured).await {
            Ok(vms) => Ok(vms),
            Err(e) if e.is_retryable() => {
                warn!("VM listing failed ({}), re-authenticating and retrying once", e);
                self.session.logout().await;
                self.fetch_vms(include_unconfigured)
                    .await
                    .map_err(|retry_err| (ApiHealth::for_failure(&e), retry_err))
            }
            Err(e) => Err((ApiHealth::ApiError, e)),
        };

        match outcome {
            Ok(vms) => {
                self.health = ApiHealth::Healthy;
                info!("VMs listed successfully ({} VMs)", vms.len());
                Ok(mapper::map_vms(&vms, include_non_scheduled))
            }
            Err((health, e)) => {
                self.health = health;
                error!("Could not list VMs: {}", e);
                Err(e)
            }
        }
    }

    /// One attempt: ensure a session, then read the listing.
    async fn fetch_vms(&mut self, include_unconfigured: bool) -> Result<Vec<RawVm>> {
        let token = self.session.ensure().await?;

        // `/1` restricts the listing to configured VMs
        let url = if include_unconfigured {
            format!("{}/vms/list/{}", self.base_url, token)
        } else {
            format!("{}/vms/list/{}/1", self.base_url, token)
        };
        debug!("Fetching VM list from: {}/vms/list/...", self.base_url);

        let response = self.http.get(&url).send().await?.error_for_status()?;
        let body = response.text().await?;
        debug!("Raw VM list response: {} bytes", body.len());

        let listing: VmListResponse = serde_json::from_str(&body).map_err(|e| {
            AltaroError::ParseError(format!(
                "Failed to parse VM list: {}. Body preview: {}...",
                e,
                body.chars().take(200).collect::<String>()
            ))
        })?;

        if !listing.success {
            let message = listing.error_message.unwrap_or_default();
            if is_token_error(&message) {
                return Err(AltaroError::InvalidToken(message));
            }
            return Err(AltaroError::Api(message));
        }

        let vms = listing.virtual_machines.unwrap_or_default();
        if vms.is_empty() {
            warn!("No VM data found in listing");
        }
        Ok(vms)
    }
}

fn is_token_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("invalid token") || (message.contains("token") && message.contains("expired"))
}

/// Response of `vms/list`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VmListResponse {
    success: bool,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    virtual_machines: Option<Vec<RawVm>>,
}

/// VM item as returned by the API.
///
/// Only the labels are typed; everything else is kept as raw JSON so one
/// malformed value does not reject the whole listing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RawVm {
    #[serde(deserialize_with = "null_as_empty")]
    pub virtual_machine_name: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub host_name: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub hypervisor_virtual_machine_uuid: String,

    /// e.g. `2024-08-13-01-53-14`, local time
    pub last_backup_time: Option<Value>,
    pub last_backup_duration: Option<Value>,
    pub last_backup_transfer_size_compressed: Option<Value>,
    pub last_backup_transfer_size_uncompressed: Option<Value>,
    pub last_backup_result: Option<Value>,

    pub last_offsite_copy_time: Option<Value>,
    pub last_offsite_copy_duration: Option<Value>,
    pub last_offsite_copy_transfer_size_compressed: Option<Value>,
    pub last_offsite_copy_transfer_size_uncompressed: Option<Value>,
    pub last_offsite_copy_result: Option<Value>,

    pub next_backup_time: Option<Value>,
    pub next_offsite_copy_time: Option<Value>,
}

/// Label value: `null` becomes `""`, numbers are rendered as text.
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}
