//! Configuration constants and URL templates for the Kiro API.

use std::time::Duration;

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Token refresh threshold - refresh when token expires within this window.
pub const TOKEN_REFRESH_THRESHOLD: Duration = Duration::from_secs(600); // 10 minutes

/// Safety margin for token expiry checks.
pub const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// Maximum number of retry attempts.
pub const MAX_RETRIES: u32 = 3;

/// Base delay between retry attempts (exponential backoff: delay * 2^attempt).
pub const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Timeout for first token in streaming responses.
pub const FIRST_TOKEN_TIMEOUT: Duration = Duration::from_secs(15);

/// Read timeout for streaming responses (between chunks).
pub const STREAMING_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Connect timeout for HTTP requests.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for non-streaming requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Floor on the account pool's expiration-aware per-record recheck delay.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Ceiling on the account pool's expiration-aware per-record recheck delay.
pub const MAX_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Fixed cadence of the pool-level background refresh loop.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Recheck delay used when a record's expiry is unknown.
pub const FALLBACK_REFRESH_INTERVAL: Duration = Duration::from_secs(1800);

/// Idleness after which a per-request bearer-cache entry is evicted.
pub const BEARER_CACHE_TTL: Duration = Duration::from_secs(300);

/// Cadence of the per-request bearer-cache sweep.
pub const BEARER_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Total deadline for a single OAuth token exchange / refresh call.
pub const OAUTH_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default total time budget for an OAuth flow before it is abandoned.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(300);

/// Default device-code poll interval when the upstream does not specify one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default closed TCP port range probed for the PKCE redirect listener.
pub const DEFAULT_CALLBACK_PORT_RANGE: (u16, u16) = (38221, 38231);

/// AWS SSO-OIDC scopes requested for device-code (builder-id) registration.
pub const SSO_OIDC_SCOPES: &[&str] = &[
    "codewhisperer:completions",
    "codewhisperer:analysis",
    "codewhisperer:conversations",
    "codewhisperer:transformations",
    "codewhisperer:taskassist",
];

/// AWS SSO-OIDC `/client/register` endpoint template.
pub const AWS_SSO_OIDC_REGISTER_URL_TEMPLATE: &str =
    "https://oidc.{region}.amazonaws.com/client/register";

/// AWS SSO-OIDC `/device_authorization` endpoint template.
pub const AWS_SSO_OIDC_DEVICE_AUTH_URL_TEMPLATE: &str =
    "https://oidc.{region}.amazonaws.com/device_authorization";

/// Kiro auth-service base (social OAuth redirect flow) template.
pub const KIRO_AUTH_SERVICE_TEMPLATE: &str = "https://prod.{region}.auth.desktop.kiro.dev";

/// Returns the AWS SSO OIDC client-registration URL for the given region.
pub fn aws_sso_oidc_register_url(region: &str) -> String {
    AWS_SSO_OIDC_REGISTER_URL_TEMPLATE.replace("{region}", region)
}

/// Returns the AWS SSO OIDC device-authorization URL for the given region.
pub fn aws_sso_oidc_device_auth_url(region: &str) -> String {
    AWS_SSO_OIDC_DEVICE_AUTH_URL_TEMPLATE.replace("{region}", region)
}

/// Returns the Kiro auth-service base URL for the given region.
pub fn kiro_auth_service_url(region: &str) -> String {
    KIRO_AUTH_SERVICE_TEMPLATE.replace("{region}", region)
}

/// Kiro Desktop Auth refresh URL template.
/// `{region}` is replaced at runtime.
pub const KIRO_REFRESH_URL_TEMPLATE: &str =
    "https://prod.{region}.auth.desktop.kiro.dev/refreshToken";

/// AWS SSO OIDC token URL template.
pub const AWS_SSO_OIDC_URL_TEMPLATE: &str = "https://oidc.{region}.amazonaws.com/token";

/// Kiro API host template (generateAssistantResponse, ListAvailableModels).
pub const KIRO_API_HOST_TEMPLATE: &str = "https://q.{region}.amazonaws.com";

/// Kiro API origin query param.
pub const API_ORIGIN: &str = "AI_EDITOR";

/// Returns the Kiro Desktop Auth refresh URL for the given region.
pub fn kiro_refresh_url(region: &str) -> String {
    KIRO_REFRESH_URL_TEMPLATE.replace("{region}", region)
}

/// Returns the AWS SSO OIDC token URL for the given region.
pub fn aws_sso_oidc_url(region: &str) -> String {
    AWS_SSO_OIDC_URL_TEMPLATE.replace("{region}", region)
}

/// Returns the Kiro API host for the given region.
pub fn kiro_api_host(region: &str) -> String {
    KIRO_API_HOST_TEMPLATE.replace("{region}", region)
}

/// Returns the generateAssistantResponse URL for the given region.
pub fn generate_assistant_response_url(region: &str, profile_arn: Option<&str>) -> String {
    let host = kiro_api_host(region);
    match profile_arn {
        Some(arn) => format!(
            "{}/generateAssistantResponse?origin={}&profileArn={}",
            host, API_ORIGIN, arn
        ),
        None => format!("{}/generateAssistantResponse?origin={}", host, API_ORIGIN),
    }
}

/// Returns the ListAvailableModels URL for the given region.
pub fn list_models_url(region: &str, profile_arn: Option<&str>) -> String {
    let host = kiro_api_host(region);
    match profile_arn {
        Some(arn) => format!(
            "{}/ListAvailableModels?origin={}&profileArn={}",
            host, API_ORIGIN, arn
        ),
        None => format!("{}/ListAvailableModels?origin={}", host, API_ORIGIN),
    }
}
