//! Upstream Client (C7): issues calls against the CodeWhisperer API using a
//! resolved [`CredentialRecord`], with the retry/backoff contract in force
//! for both plain and streaming requests.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::auth::constants::machine_fingerprint;
use crate::config::{self, BASE_RETRY_DELAY, CONNECT_TIMEOUT, MAX_RETRIES, REQUEST_TIMEOUT};
use crate::error::{Error, Result};
use crate::models::account::{AuthKind, CredentialRecord};
use crate::refresher::TokenRefresher;
use crate::store::CredentialStore;
use crate::transport::headers;

/// Issues upstream calls on behalf of a resolved credential, retrying
/// transport errors and 5xx responses with exponential backoff and
/// force-refreshing the credential when a 401 is seen.
pub struct UpstreamClient {
    client: reqwest::Client,
    streaming_client: reqwest::Client,
    refresher: Arc<TokenRefresher>,
    fingerprint: String,
}

impl UpstreamClient {
    /// Build a client that refreshes through `store` when it sees a 401.
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            streaming_client: reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .expect("failed to build streaming HTTP client"),
            refresher: Arc::new(TokenRefresher::new(store)),
            fingerprint: machine_fingerprint(),
        }
    }

    fn body_with_profile_arn(&self, record: &CredentialRecord, mut body: serde_json::Value) -> serde_json::Value {
        // `profile_arn` is only valid in the body for Kiro-Desktop-originated
        // (social) credentials; device-code credentials 403 if it's present.
        if record.auth_kind == AuthKind::Social {
            if let Some(arn) = &record.profile_arn {
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("profileArn".into(), serde_json::Value::String(arn.clone()));
                }
            }
        }
        body
    }

    /// Non-streaming POST with the full retry contract applied.
    pub async fn post(
        &self,
        url: &str,
        record: &mut CredentialRecord,
        body: serde_json::Value,
    ) -> Result<reqwest::Response> {
        let body = self.body_with_profile_arn(record, body);
        self.send_with_retry(&self.client.clone(), url, record, &body).await
    }

    /// Streaming POST. C7 never buffers the response body; the handle is
    /// returned to the caller (the stream transcoder) on first success.
    pub async fn post_streaming(
        &self,
        url: &str,
        record: &mut CredentialRecord,
        body: serde_json::Value,
    ) -> Result<reqwest::Response> {
        let body = self.body_with_profile_arn(record, body);
        self.send_with_retry(&self.streaming_client.clone(), url, record, &body)
            .await
    }

    /// Issue a `generateAssistantResponse` streaming call for `record`'s region.
    pub async fn generate(
        &self,
        record: &mut CredentialRecord,
        body: serde_json::Value,
    ) -> Result<reqwest::Response> {
        let url = config::generate_assistant_response_url(&record.region, record.profile_arn.as_deref());
        self.post_streaming(&url, record, body).await
    }

    /// List models available to `record`'s region/profile.
    pub async fn list_models(&self, record: &mut CredentialRecord) -> Result<reqwest::Response> {
        let url = config::list_models_url(&record.region, record.profile_arn.as_deref());
        self.get(&url, record).await
    }

    /// GET with the same retry contract (used for model listing).
    pub async fn get(&self, url: &str, record: &mut CredentialRecord) -> Result<reqwest::Response> {
        let mut last_error = None;
        let mut saw_401 = false;

        for attempt in 1..=MAX_RETRIES {
            if attempt > 1 {
                if saw_401 {
                    self.force_refresh(record).await;
                    saw_401 = false;
                }
                let delay = BASE_RETRY_DELAY * 2u32.pow(attempt - 2);
                debug!(attempt, delay_ms = delay.as_millis(), "Retrying GET");
                tokio::time::sleep(delay).await;
            }

            let hdrs = headers::kiro_api_headers(&record.access_token, &self.fingerprint);
            match self.client.get(url).headers(hdrs).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body_text = response.text().await.unwrap_or_default();
                    if status == 401 {
                        saw_401 = true;
                    }
                    if !should_retry(status) && status != 401 {
                        return Err(Error::UpstreamHttpError {
                            status,
                            message: body_text,
                        });
                    }
                    warn!(status, "Upstream GET failed, will retry");
                    last_error = Some(Error::UpstreamHttpError {
                        status,
                        message: body_text,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Upstream GET transport error, will retry");
                    last_error = Some(Error::Network(e));
                }
            }
        }

        Err(Error::RetriesExhausted {
            attempts: MAX_RETRIES,
            message: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn send_with_retry(
        &self,
        client: &reqwest::Client,
        url: &str,
        record: &mut CredentialRecord,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let mut last_error = None;
        let mut saw_401 = false;

        for attempt in 1..=MAX_RETRIES {
            if attempt > 1 {
                if saw_401 {
                    self.force_refresh(record).await;
                    saw_401 = false;
                }
                let delay = BASE_RETRY_DELAY * 2u32.pow(attempt - 2);
                debug!(attempt, delay_ms = delay.as_millis(), "Retrying upstream request");
                tokio::time::sleep(delay).await;
            }

            let hdrs = headers::kiro_streaming_headers(&record.access_token, &self.fingerprint);
            match client.post(url).headers(hdrs).json(body).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status == 401 {
                        saw_401 = true;
                    }
                    if !should_retry(status) && status != 401 {
                        let body_text = response.text().await.unwrap_or_default();
                        return Err(Error::UpstreamHttpError {
                            status,
                            message: body_text,
                        });
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    warn!(status, "Upstream request failed, will retry");
                    last_error = Some(Error::UpstreamHttpError {
                        status,
                        message: body_text,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Upstream transport error, will retry");
                    last_error = Some(Error::Network(e));
                }
            }
        }

        Err(Error::RetriesExhausted {
            attempts: MAX_RETRIES,
            message: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn force_refresh(&self, record: &mut CredentialRecord) {
        match self.refresher.refresh(record).await {
            Ok(refreshed) => {
                debug!(id = record.id, "Credential force-refreshed after 401");
                *record = refreshed;
            }
            Err(e) => {
                warn!(id = record.id, error = %e, "Force refresh after 401 failed");
            }
        }
    }
}

/// Whether `status` alone (ignoring the 401-after-refresh carve-out handled
/// at the call site) warrants a retry: HTTP 5xx only, never other 4xx.
fn should_retry(status: u16) -> bool {
    (500..600).contains(&status)
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::should_retry;

    #[test]
    fn retries_only_on_5xx() {
        assert!(should_retry(500));
        assert!(should_retry(503));
        assert!(!should_retry(401));
        assert!(!should_retry(403));
        assert!(!should_retry(429));
        assert!(!should_retry(200));
    }
}
