//! OpenID Connect provider over HTTP.
//!
//! Interactive login opens the authorization page in the system browser and
//! waits for the redirect on a one-shot loopback listener.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::{AuthProvider, Grant};
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::shell::ExternalOpener;

const CALLBACK_PATH: &str = "/callback";
const CALLBACK_PAGE: &str = "<html><body>You can close this window and return to the application.</body></html>";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

/// What the browser redirect carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Callback {
    Code(String),
    Denied,
    Error(String),
}

/// Reads `code`/`error` off a redirect request target. `state` must echo
/// `expected_state`.
pub(crate) fn parse_callback(target: &str, expected_state: &str) -> Callback {
    let url = match Url::parse(&format!("http://127.0.0.1{}", target)) {
        Ok(url) => url,
        Err(e) => return Callback::Error(format!("bad redirect target: {}", e)),
    };
    if url.path() != CALLBACK_PATH {
        return Callback::Error(format!("unexpected path {}", url.path()));
    }

    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }

    match (error.as_deref(), code) {
        (Some("access_denied"), _) => Callback::Denied,
        (Some(other), _) => Callback::Error(other.to_string()),
        (None, Some(code)) if state.as_deref() == Some(expected_state) => Callback::Code(code),
        (None, Some(_)) => Callback::Error("state mismatch".to_string()),
        (None, None) => Callback::Error("redirect without code".to_string()),
    }
}

pub struct HttpAuthProvider {
    client: reqwest::Client,
    config: AuthConfig,
    opener: Arc<dyn ExternalOpener>,
}

impl HttpAuthProvider {
    pub fn new(config: AuthConfig, opener: Arc<dyn ExternalOpener>) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            config,
            opener,
        })
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<Grant, AuthError> {
        let response = self
            .client
            .post(self.config.token_endpoint())
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            debug!("Token endpoint answered {}", status);
            return Ok(Grant::rejected());
        }
        if !status.is_success() {
            return Err(AuthError::Transport(format!("token endpoint answered {}", status)));
        }

        let body: TokenResponse = response.json().await?;
        Ok(match body.access_token {
            Some(access) => Grant::granted(access, body.refresh_token),
            None => Grant::rejected(),
        })
    }

    /// Serves the loopback listener until the browser hits the callback
    /// path. Stray requests (favicon) get a 404.
    async fn wait_for_redirect(&self, listener: TcpListener, state: &str) -> Result<Callback, AuthError> {
        loop {
            let (mut stream, peer) = listener.accept().await?;
            let (reader, mut writer) = stream.split();
            let mut request_line = String::new();
            BufReader::new(reader).read_line(&mut request_line).await?;
            let target = request_line.split_whitespace().nth(1).unwrap_or_default().to_string();
            debug!("Loopback request from {}: {}", peer, target);

            let is_callback = target.split('?').next() == Some(CALLBACK_PATH);
            let response = if is_callback {
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    CALLBACK_PAGE.len(),
                    CALLBACK_PAGE
                )
            } else {
                "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
            };
            if let Err(e) = writer.write_all(response.as_bytes()).await {
                warn!("Could not answer loopback request: {}", e);
            }

            if is_callback {
                return Ok(parse_callback(&target, state));
            }
        }
    }
}

#[async_trait]
impl AuthProvider for HttpAuthProvider {
    async fn request_token(&self, nonce: &str, login_target: &str) -> Result<Grant, AuthError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let redirect_uri = format!("http://127.0.0.1:{}{}", listener.local_addr()?.port(), CALLBACK_PATH);
        let scope = self.config.scopes.join(" ");

        let authorize = Url::parse_with_params(
            login_target,
            &[
                ("response_type", "code"),
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("state", nonce),
                ("nonce", nonce),
            ],
        )
        .map_err(|e| AuthError::Transport(format!("bad login target {}: {}", login_target, e)))?;

        self.opener
            .open_url(&authorize)
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        info!("Waiting for the browser login on {}", redirect_uri);

        let timeout = Duration::from_secs(self.config.login_timeout_secs);
        let callback = match tokio::time::timeout(timeout, self.wait_for_redirect(listener, nonce)).await {
            Ok(callback) => callback?,
            Err(_) => {
                info!("No login redirect after {:?}, treating as cancelled", timeout);
                return Ok(Grant::cancelled());
            }
        };

        match callback {
            Callback::Code(code) => {
                self.token_request(&[
                    ("grant_type", "authorization_code"),
                    ("code", code.as_str()),
                    ("redirect_uri", redirect_uri.as_str()),
                    ("client_id", self.config.client_id.as_str()),
                ])
                .await
            }
            Callback::Denied => Ok(Grant::cancelled()),
            Callback::Error(reason) => {
                warn!("Login redirect carried an error: {}", reason);
                Ok(Grant::rejected())
            }
        }
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<Grant, AuthError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ])
        .await
    }

    async fn user_data(&self, access_token: &str) -> Result<Value, AuthError> {
        let response = self
            .client
            .get(self.config.userinfo_endpoint())
            .bearer_auth(access_token)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}
