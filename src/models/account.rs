//! Credential record: one row describing a single upstream Kiro identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config;

/// Which upstream refresh protocol a record was acquired through.
///
/// This is the nominal label; C3's actual dispatch rule can override it when
/// `client_id`/`client_secret` are present (see [`CredentialRecord::refresh_dispatch`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    /// Social login (Google/GitHub) via the PKCE redirect flow.
    Social,
    /// AWS Builder ID via the device-code flow.
    BuilderId,
    /// AWS Identity Center (IdC) via SSO-OIDC.
    Idc,
}

impl std::fmt::Display for AuthKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Social => write!(f, "social"),
            Self::BuilderId => write!(f, "builder-id"),
            Self::Idc => write!(f, "IdC"),
        }
    }
}

impl std::str::FromStr for AuthKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "social" => Ok(Self::Social),
            "builder-id" | "builder_id" => Ok(Self::BuilderId),
            "IdC" | "idc" => Ok(Self::Idc),
            other => Err(format!("unknown auth_kind: {other}")),
        }
    }
}

/// Derived health status of a credential record (never stored).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// `is_active` is false.
    Inactive,
    /// No access token has ever been obtained.
    NoToken,
    /// `now >= expires_at`.
    Expired,
    /// `expires_at - now <= REFRESH_THRESHOLD`.
    ExpiringSoon,
    /// None of the above.
    Healthy,
}

/// Refresh protocol C3 should use for a given record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshProtocol {
    /// POST to the regional SSO-OIDC `/token` endpoint.
    SsoOidc,
    /// POST to the regional Kiro auth-service `/refreshToken` endpoint.
    KiroSocial,
    /// Neither protocol has the credentials it needs.
    MissingCredentials,
}

/// One upstream identity: immutable-after-commit aside from the fields C3/C5/admin mutate.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Stable integer identity within a store.
    pub id: i64,
    /// Human label.
    pub name: String,
    /// Nominal auth protocol family.
    pub auth_kind: AuthKind,
    /// Optional identity-provider tag (`Google` | `GitHub` | `AWS`).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub provider: Option<String>,
    /// Current bearer access token.
    #[serde(default)]
    pub access_token: String,
    /// Long-lived refresh token.
    pub refresh_token: String,
    /// CodeWhisperer profile ARN; required only by the Kiro-Desktop auth variant.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub profile_arn: Option<String>,
    /// Upstream region tag.
    #[serde(default = "default_region")]
    pub region: String,
    /// Absolute UTC instant when `access_token` ceases to be valid.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// OAuth client id; present for device-code-acquired credentials.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_id: Option<String>,
    /// OAuth client secret; present for device-code-acquired credentials.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_secret: Option<String>,
    /// Whether the record is visible to the account pool.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Monotonically non-decreasing usage counter.
    #[serde(default)]
    pub request_count: u64,
    /// When this record was last handed out by the pool.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_used_at: Option<DateTime<Utc>>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last mutated.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_region() -> String {
    config::DEFAULT_REGION.to_string()
}

fn default_true() -> bool {
    true
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("auth_kind", &self.auth_kind)
            .field("provider", &self.provider)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("profile_arn", &self.profile_arn)
            .field("region", &self.region)
            .field("expires_at", &self.expires_at)
            .field("client_id", &self.client_id.as_ref().map(|_| "[REDACTED]"))
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("is_active", &self.is_active)
            .field("request_count", &self.request_count)
            .field("last_used_at", &self.last_used_at)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

impl CredentialRecord {
    /// Seconds until expiry, or `None` if `expires_at` is unset.
    pub fn ttl(&self) -> Option<i64> {
        self.expires_at
            .map(|exp| (exp - Utc::now()).num_seconds())
    }

    /// Derived, never-stored health status.
    pub fn health(&self) -> HealthStatus {
        if !self.is_active {
            return HealthStatus::Inactive;
        }
        if self.access_token.is_empty() {
            return HealthStatus::NoToken;
        }
        match self.ttl() {
            None => HealthStatus::Healthy,
            Some(ttl) if ttl <= 0 => HealthStatus::Expired,
            Some(ttl) if ttl <= config::TOKEN_REFRESH_THRESHOLD.as_secs() as i64 => {
                HealthStatus::ExpiringSoon
            }
            Some(_) => HealthStatus::Healthy,
        }
    }

    /// True if `expires_at - now <= REFRESH_THRESHOLD` (or unknown, treated as due).
    pub fn is_expiring_soon(&self) -> bool {
        matches!(
            self.health(),
            HealthStatus::ExpiringSoon | HealthStatus::Expired | HealthStatus::NoToken
        )
    }

    /// C3's dispatch rule: `client_id`+`client_secret` present overrides the nominal
    /// `auth_kind` and forces SSO-OIDC refresh; otherwise `social` uses the Kiro
    /// auth-service; anything else is a pre-flight failure.
    pub fn refresh_dispatch(&self) -> RefreshProtocol {
        if self.client_id.is_some() && self.client_secret.is_some() {
            RefreshProtocol::SsoOidc
        } else if self.auth_kind == AuthKind::Social {
            RefreshProtocol::KiroSocial
        } else {
            RefreshProtocol::MissingCredentials
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn base_record() -> CredentialRecord {
        CredentialRecord {
            id: 1,
            name: "test".into(),
            auth_kind: AuthKind::Social,
            provider: None,
            access_token: "at".into(),
            refresh_token: "rt".into(),
            profile_arn: None,
            region: "us-east-1".into(),
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
            client_id: None,
            client_secret: None,
            is_active: true,
            request_count: 0,
            last_used_at: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn dispatch_rule_prefers_client_credentials_over_social_label() {
        let mut rec = base_record();
        assert_eq!(rec.refresh_dispatch(), RefreshProtocol::KiroSocial);

        rec.client_id = Some("C".into());
        rec.client_secret = Some("S".into());
        assert_eq!(rec.refresh_dispatch(), RefreshProtocol::SsoOidc);
    }

    #[test]
    fn dispatch_rule_fails_without_any_credentials() {
        let mut rec = base_record();
        rec.auth_kind = AuthKind::Idc;
        assert_eq!(rec.refresh_dispatch(), RefreshProtocol::MissingCredentials);
    }

    #[test]
    fn health_reflects_expiry_window() {
        let mut rec = base_record();
        assert_eq!(rec.health(), HealthStatus::Healthy);

        rec.expires_at = Some(Utc::now() - ChronoDuration::seconds(1));
        assert_eq!(rec.health(), HealthStatus::Expired);

        rec.expires_at = Some(Utc::now() + ChronoDuration::seconds(100));
        assert_eq!(rec.health(), HealthStatus::ExpiringSoon);

        rec.is_active = false;
        assert_eq!(rec.health(), HealthStatus::Inactive);
    }
}
