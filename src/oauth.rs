//! OAuth Acquirer (C4): two mutually exclusive flows for turning user
//! interaction into a new credential record — PKCE browser redirect (social)
//! and AWS SSO-OIDC device-code (builder-id).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::{
    aws_sso_oidc_device_auth_url, aws_sso_oidc_register_url, kiro_auth_service_url,
    DEFAULT_AUTH_TIMEOUT, DEFAULT_CALLBACK_PORT_RANGE, DEFAULT_POLL_INTERVAL, SSO_OIDC_SCOPES,
};
use crate::error::{Error, Result};
use crate::models::account::AuthKind;
use crate::store::NewCredential;

/// Details needed to start a PKCE redirect flow: the URL to send the user to,
/// and the port the embedded listener is bound to.
#[derive(Debug, Clone)]
pub struct PkceAuthorization {
    pub authorize_url: String,
    pub port: u16,
}

/// Details needed for a caller to present a device-code flow to the user.
#[derive(Debug, Clone)]
pub struct DeviceCodePrompt {
    pub verification_uri: String,
    pub user_code: String,
    pub expires_in: i64,
}

/// Drives OAuth acquisition. At most one flow runs at a time per instance;
/// starting a new flow cancels any flow already in progress.
pub struct OAuthAcquirer {
    client: reqwest::Client,
    region: String,
    cancelled: Arc<AtomicBool>,
}

impl OAuthAcquirer {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            region: region.into(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel whichever flow is currently in progress on this instance.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn reset_cancellation(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    // ── PKCE redirect flow (social) ──────────────────────────────────────

    /// Bind the embedded redirect listener and build the authorization URL.
    /// Call [`OAuthAcquirer::complete_pkce`] with the returned listener to
    /// await the callback and finish the flow.
    pub async fn start_pkce(&self, idp: &str) -> Result<(PkceAuthorization, PkceSession)> {
        self.reset_cancellation();

        let mut verifier_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut verifier_bytes);
        let code_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
        let code_challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()));

        let mut state_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut state_bytes);
        let state = URL_SAFE_NO_PAD.encode(state_bytes);

        let (port, listener) = bind_first_free_port(DEFAULT_CALLBACK_PORT_RANGE).await?;
        let redirect_uri = format!("http://127.0.0.1:{port}/oauth/callback");

        let authorize_url = format!(
            "{}/login?idp={}&redirect_uri={}&code_challenge={}&code_challenge_method=S256&state={}&prompt=select_account",
            kiro_auth_service_url(&self.region),
            idp,
            redirect_uri,
            code_challenge,
            state,
        );

        info!(port, "PKCE redirect listener bound, awaiting callback");

        Ok((
            PkceAuthorization { authorize_url, port },
            PkceSession {
                listener,
                state,
                code_verifier,
                redirect_uri,
            },
        ))
    }

    /// Accept exactly one inbound callback, exchange the code, and return a
    /// new credential record.
    pub async fn complete_pkce(&self, session: PkceSession) -> Result<NewCredential> {
        let code = accept_callback(session.listener, &session.state).await?;

        if self.cancelled.load(Ordering::SeqCst) {
            return Err(Error::OAuthProviderError("flow cancelled".into()));
        }

        let payload = serde_json::json!({
            "code": code,
            "code_verifier": session.code_verifier,
            "redirect_uri": session.redirect_uri,
        });

        let url = format!("{}/oauth/token", kiro_auth_service_url(&self.region));
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::OAuthProviderError(format!("token exchange failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamHttpError {
                status,
                message: body,
            });
        }

        let data: PkceTokenResponse = response
            .json()
            .await
            .map_err(|e| Error::MalformedUpstreamResponse(e.to_string()))?;

        if data.access_token.is_empty() {
            return Err(Error::MalformedUpstreamResponse(
                "token exchange response missing accessToken".into(),
            ));
        }

        Ok(NewCredential {
            name: "social".into(),
            auth_kind: AuthKind::Social,
            provider: None,
            access_token: data.access_token,
            refresh_token: data.refresh_token.unwrap_or_default(),
            profile_arn: data.profile_arn,
            region: self.region.clone(),
            expires_at: Some(
                chrono::Utc::now() + chrono::Duration::seconds(data.expires_in.unwrap_or(3600)),
            ),
            client_id: None,
            client_secret: None,
        })
    }

    // ── Device-code flow (builder-id) ────────────────────────────────────

    /// Register a client and start a device-code authorization, returning a
    /// prompt to present to the user plus a session to poll for completion.
    pub async fn start_device_code(&self, start_url: &str) -> Result<(DeviceCodePrompt, DeviceCodeSession)> {
        self.reset_cancellation();

        let register_payload = serde_json::json!({
            "clientName": "kiro-gateway",
            "clientType": "public",
            "scopes": SSO_OIDC_SCOPES,
        });
        let register_url = aws_sso_oidc_register_url(&self.region);
        let register: ClientRegistration = self
            .client
            .post(&register_url)
            .json(&register_payload)
            .send()
            .await
            .map_err(|e| Error::OAuthProviderError(format!("client registration failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::MalformedUpstreamResponse(e.to_string()))?;

        let auth_payload = serde_json::json!({
            "clientId": register.client_id,
            "clientSecret": register.client_secret,
            "startUrl": start_url,
        });
        let device_auth_url = aws_sso_oidc_device_auth_url(&self.region);
        let device_auth: DeviceAuthorization = self
            .client
            .post(&device_auth_url)
            .json(&auth_payload)
            .send()
            .await
            .map_err(|e| Error::OAuthProviderError(format!("device authorization failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::MalformedUpstreamResponse(e.to_string()))?;

        let verification_uri = device_auth
            .verification_uri_complete
            .unwrap_or(device_auth.verification_uri);

        let prompt = DeviceCodePrompt {
            verification_uri,
            user_code: device_auth.user_code,
            expires_in: device_auth.expires_in,
        };

        let session = DeviceCodeSession {
            client_id: register.client_id,
            client_secret: register.client_secret,
            device_code: device_auth.device_code,
            interval: device_auth.interval.max(1),
        };

        Ok((prompt, session))
    }

    /// Poll `/token` until the device-code flow succeeds, fails, or expires.
    pub async fn complete_device_code(&self, session: DeviceCodeSession) -> Result<NewCredential> {
        let token_url = crate::config::aws_sso_oidc_url(&self.region);
        let deadline = tokio::time::Instant::now() + DEFAULT_AUTH_TIMEOUT;
        let mut interval = Duration::from_secs(session.interval as u64);

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(Error::OAuthProviderError("flow cancelled".into()));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::DeviceCodeExpired);
            }

            tokio::time::sleep(interval.min(DEFAULT_POLL_INTERVAL.max(interval))).await;

            let payload = serde_json::json!({
                "clientId": session.client_id,
                "clientSecret": session.client_secret,
                "deviceCode": session.device_code,
                "grantType": "urn:ietf:params:oauth:grant-type:device_code",
            });

            let response = self
                .client
                .post(&token_url)
                .json(&payload)
                .send()
                .await
                .map_err(|e| Error::OAuthProviderError(format!("device poll failed: {e}")))?;

            if response.status().is_success() {
                let data: DeviceTokenResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::MalformedUpstreamResponse(e.to_string()))?;
                if data.access_token.is_empty() {
                    return Err(Error::MalformedUpstreamResponse(
                        "device token response missing accessToken".into(),
                    ));
                }
                return Ok(NewCredential {
                    name: "builder-id".into(),
                    auth_kind: AuthKind::Idc,
                    provider: None,
                    access_token: data.access_token,
                    refresh_token: data.refresh_token.unwrap_or_default(),
                    profile_arn: None,
                    region: self.region.clone(),
                    expires_at: Some(
                        chrono::Utc::now() + chrono::Duration::seconds(data.expires_in),
                    ),
                    client_id: Some(session.client_id.clone()),
                    client_secret: Some(session.client_secret.clone()),
                });
            }

            let body: DeviceErrorResponse = response.json().await.unwrap_or_default();
            match body.error.as_deref() {
                Some("authorization_pending") => {
                    debug!("Device code pending, waiting one interval");
                    continue;
                }
                Some("slow_down") => {
                    interval += Duration::from_secs(5);
                    warn!(?interval, "Device code slow_down, backing off");
                    continue;
                }
                Some("expired_token") => return Err(Error::DeviceCodeExpired),
                Some("access_denied") => return Err(Error::UserDenied),
                Some(other) => return Err(Error::OAuthProviderError(other.to_string())),
                None => {
                    return Err(Error::OAuthProviderError(
                        "device token poll failed with no error field".into(),
                    ))
                }
            }
        }
    }
}

/// State carried between [`OAuthAcquirer::start_pkce`] and
/// [`OAuthAcquirer::complete_pkce`].
pub struct PkceSession {
    listener: TcpListener,
    state: String,
    code_verifier: String,
    redirect_uri: String,
}

/// State carried between [`OAuthAcquirer::start_device_code`] and
/// [`OAuthAcquirer::complete_device_code`].
pub struct DeviceCodeSession {
    client_id: String,
    client_secret: String,
    device_code: String,
    interval: i64,
}

async fn bind_first_free_port(range: (u16, u16)) -> Result<(u16, TcpListener)> {
    for port in range.0..=range.1 {
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
            return Ok((port, listener));
        }
    }
    Err(Error::Config(format!(
        "no free callback port in range {}-{}",
        range.0, range.1
    )))
}

/// Accept exactly one connection, parse the request line, validate `state`,
/// and respond. Returns the `code` query parameter on success.
async fn accept_callback(listener: TcpListener, expected_state: &str) -> Result<String> {
    let (stream, _) = listener
        .accept()
        .await
        .map_err(|e| Error::OAuthProviderError(format!("callback accept failed: {e}")))?;

    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .await
        .map_err(|e| Error::OAuthProviderError(format!("callback read failed: {e}")))?;

    // Consume headers up to the blank line; we don't need their values.
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.unwrap_or(0);
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let mut stream = reader.into_inner();

    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("")
        .to_string();

    if !request_line.starts_with("GET /oauth/callback") {
        respond(&mut stream, 204, "").await;
        return Err(Error::OAuthProviderError(
            "callback received non-GET or unexpected path".into(),
        ));
    }

    let query = path.split_once('?').map(|(_, q)| q).unwrap_or("");
    let params = parse_query(query);

    if let Some(err) = params.get("error") {
        respond_html(&mut stream, 400, "Authentication failed.").await;
        return Err(Error::OAuthProviderError(err.clone()));
    }

    match params.get("state") {
        Some(state) if state == expected_state => {}
        _ => {
            respond_html(&mut stream, 400, "State mismatch.").await;
            return Err(Error::OAuthStateMismatch);
        }
    }

    let code = params
        .get("code")
        .cloned()
        .ok_or_else(|| Error::OAuthProviderError("callback missing code parameter".into()))?;

    respond_html(&mut stream, 200, "Authentication successful. You may close this window.").await;
    Ok(code)
}

fn parse_query(query: &str) -> std::collections::HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((
                urlencoding_decode(k),
                urlencoding_decode(v),
            ))
        })
        .collect()
}

/// Minimal percent-decoder: no external dependency, used only for the tiny
/// query strings the embedded redirect listener sees.
fn urlencoding_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '+' => out.push(' '),
            '%' => {
                let hex: String = chars.by_ref().take(2).collect();
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    out.push(byte as char);
                } else {
                    out.push('%');
                    out.push_str(&hex);
                }
            }
            other => out.push(other),
        }
    }
    out
}

async fn respond(stream: &mut TcpStream, status: u16, body: &str) {
    let reason = match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn respond_html(stream: &mut TcpStream, status: u16, message: &str) {
    let body = format!("<html><body><h3>{message}</h3></body></html>");
    let reason = if status == 200 { "OK" } else { "Bad Request" };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PkceTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    profile_arn: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientRegistration {
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceAuthorization {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    expires_in: i64,
    #[serde(default = "default_poll_interval_secs")]
    interval: i64,
}

fn default_poll_interval_secs() -> i64 {
    DEFAULT_POLL_INTERVAL.as_secs() as i64
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Deserialize, Default)]
struct DeviceErrorResponse {
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing_handles_percent_and_plus_encoding() {
        let params = parse_query("state=abc%2Bdef&code=xyz&redirect=a+b");
        assert_eq!(params.get("state").unwrap(), "abc+def");
        assert_eq!(params.get("code").unwrap(), "xyz");
        assert_eq!(params.get("redirect").unwrap(), "a b");
    }

    #[tokio::test]
    async fn bind_first_free_port_finds_a_port_in_range() {
        let (port, _listener) = bind_first_free_port((38221, 38231)).await.unwrap();
        assert!((38221..=38231).contains(&port));
    }

    #[tokio::test]
    async fn callback_state_mismatch_is_rejected_with_400() {
        let (port, listener) = bind_first_free_port((38221, 38231)).await.unwrap();
        let accept = tokio::spawn(accept_callback(listener, "expected-state"));

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client
            .write_all(b"GET /oauth/callback?code=X&state=WRONG HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        use tokio::io::AsyncReadExt;
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 400"));

        let result = accept.await.unwrap();
        assert!(matches!(result, Err(Error::OAuthStateMismatch)));
    }
}
