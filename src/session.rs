//! Session management for the Altaro REST API.
//!
//! The API hands out an opaque token on `sessions/start` and expects it on
//! every later call. Tokens expire server-side on their own schedule, and the
//! server refuses a new login while it still believes an old session is open.
//! [`SessionManager`] owns the single token of a client as a small state
//! machine: `Absent -> Active -> Absent`.

use crate::config::AltaroConfig;
use crate::error::{AltaroError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Session state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Session {
    /// No token held
    #[default]
    Absent,
    /// Logged in with this token
    Active { token: String },
}

/// Login/logout request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Credentials {
    server_port: u16,
    server_address: String,
    username: String,
    password: String,
    domain: String,
}

/// Response of `sessions/start` and `sessions/end`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SessionResponse {
    success: bool,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

/// Owns the session token of one API client.
pub struct SessionManager {
    http: Client,
    base_url: String,
    credentials: Credentials,
    state: Session,
}

impl SessionManager {
    /// Create a session manager in the `Absent` state. No request is sent.
    pub fn new(http: Client, config: &AltaroConfig) -> Self {
        let domain = if config.domain.is_empty() {
            warn!("No Altaro domain given, using '.' by default");
            ".".to_string()
        } else {
            config.domain.clone()
        };

        Self {
            http,
            base_url: config.base_url(),
            credentials: Credentials {
                server_port: config.server_port,
                server_address: config.server_address.clone(),
                username: config.username.clone(),
                password: config.password.clone(),
                domain,
            },
            state: Session::Absent,
        }
    }

    /// Current state.
    pub fn state(&self) -> &Session {
        &self.state
    }

    /// Token of the active session, if any.
    pub fn token(&self) -> Option<&str> {
        match &self.state {
            Session::Active { token } => Some(token),
            Session::Absent => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, Session::Active { .. })
    }

    /// Open a session and store its token.
    ///
    /// On any failure the state stays `Absent`. A [`AltaroError::SessionBusy`]
    /// means the server still holds an older session for this account; it goes
    /// away by itself after a few minutes.
    pub async fn login(&mut self) -> Result<()> {
        info!(
            "Logging in as {} on server {}:{} via {}",
            self.credentials.username,
            self.credentials.server_address,
            self.credentials.server_port,
            self.base_url
        );

        let url = format!("{}/sessions/start", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&self.credentials)
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        let reply: SessionResponse = serde_json::from_str(&body).map_err(|e| {
            AltaroError::ParseError(format!("Failed to parse login response: {}", e))
        })?;

        if !reply.success {
            let message = reply.error_message.unwrap_or_default();
            if message.to_ascii_lowercase().contains("already") {
                warn!(
                    "Login refused, the server still holds a session ({}). Wait about 5 minutes for the Altaro API to close it",
                    message
                );
                return Err(AltaroError::SessionBusy(message));
            }
            warn!("Login request succeeded but response failed with: {}", message);
            return Err(AltaroError::Auth(message));
        }

        match reply.data.filter(|token| !token.is_empty()) {
            Some(token) => {
                self.state = Session::Active { token };
                info!("Session established");
                Ok(())
            }
            None => Err(AltaroError::Auth(
                "login succeeded but no session token was returned".to_string(),
            )),
        }
    }

    /// Close the current session. The token is dropped whatever the outcome.
    ///
    /// The token goes in the path, `POST {base}/sessions/end/{token}`, with
    /// the login credentials as body.
    pub async fn logout(&mut self) {
        let token = match std::mem::take(&mut self.state) {
            Session::Active { token } => token,
            Session::Absent => {
                debug!("Logout requested without an active session");
                return;
            }
        };

        let url = format!("{}/sessions/end/{}", self.base_url, token);
        match self.http.post(&url).json(&self.credentials).send().await {
            Ok(response) if response.status().is_success() => info!("Session closed"),
            Ok(response) => warn!("Logout returned HTTP {}", response.status()),
            Err(e) => warn!("Logout failed: {}", e.without_url()),
        }
    }

    /// Return the active token, logging in first if needed.
    pub async fn ensure(&mut self) -> Result<String> {
        if let Session::Active { token } = &self.state {
            return Ok(token.clone());
        }
        self.login().await?;
        self.token()
            .map(str::to_string)
            .ok_or_else(|| AltaroError::Auth("no session after login".to_string()))
    }
}
