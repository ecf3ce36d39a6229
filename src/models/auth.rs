//! Wire response shapes for the upstream OAuth refresh endpoints.

use serde::Deserialize;

/// Response from Kiro Desktop Auth refresh endpoint.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiroDesktopRefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    #[serde(default)]
    pub profile_arn: Option<String>,
}

impl std::fmt::Debug for KiroDesktopRefreshResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KiroDesktopRefreshResponse")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .field("profile_arn", &self.profile_arn)
            .finish()
    }
}

/// Response from AWS SSO OIDC token endpoint.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsSsoOidcRefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
}

impl std::fmt::Debug for AwsSsoOidcRefreshResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsSsoOidcRefreshResponse")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

fn default_expires_in() -> i64 {
    3600
}
