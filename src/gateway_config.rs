//! Process-environment configuration, assembled once at startup.
//!
//! Mirrors the named-constant style of [`crate::config`] rather than a
//! generic deserialized config file: every recognised key is read through a
//! small builder and validated eagerly so a malformed value fails at boot,
//! not on first use.

use std::time::Duration;

use crate::config::{
    DEFAULT_AUTH_TIMEOUT, DEFAULT_CALLBACK_PORT_RANGE, DEFAULT_POLL_INTERVAL, DEFAULT_REGION,
    FIRST_TOKEN_TIMEOUT, MAX_RETRIES, STREAMING_READ_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::resolver::AuthMode;

/// Selects which credential backend backs the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// `DATABASE_URL` was set: the relational (SQLite) backend.
    Sqlite(String),
    /// No `DATABASE_URL`: the single-JSON-document file backend.
    File,
}

/// Fully resolved gateway configuration, read once at process startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub region: String,
    pub auth_mode: AuthMode,
    pub storage: StorageBackend,
    pub refresh_token: Option<String>,
    pub profile_arn: Option<String>,
    pub credentials_file: Option<String>,
    pub first_token_timeout: Duration,
    pub first_token_max_retries: u32,
    pub streaming_read_timeout: Duration,
    pub callback_port_range: (u16, u16),
    pub oauth_auth_timeout: Duration,
    pub oauth_poll_interval: Duration,
}

impl GatewayConfig {
    /// Build a [`GatewayConfig`] from `std::env`, applying the same typed
    /// defaults as a builder constructed entirely from
    /// [`GatewayConfigBuilder::new`] would.
    pub fn from_env() -> Result<Self> {
        GatewayConfigBuilder::new().load_env().build()
    }
}

/// Assembles a [`GatewayConfig`] field by field, validating eagerly on [`build`](Self::build).
#[derive(Default)]
pub struct GatewayConfigBuilder {
    region: Option<String>,
    auth_mode: Option<String>,
    database_url: Option<String>,
    refresh_token: Option<String>,
    profile_arn: Option<String>,
    credentials_file: Option<String>,
    first_token_timeout: Option<String>,
    first_token_max_retries: Option<String>,
    streaming_read_timeout: Option<String>,
    callback_port_start: Option<String>,
    callback_port_end: Option<String>,
    oauth_auth_timeout: Option<String>,
    oauth_poll_interval: Option<String>,
}

impl GatewayConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate every field from its matching environment variable, if set.
    pub fn load_env(mut self) -> Self {
        self.region = std::env::var("kiro_region").ok();
        self.auth_mode = std::env::var("AUTH_MODE").ok();
        self.database_url = std::env::var("DATABASE_URL").ok();
        self.refresh_token = std::env::var("refresh_token").ok();
        self.profile_arn = std::env::var("profile_arn").ok();
        self.credentials_file = std::env::var("kiro_creds_file").ok();
        self.first_token_timeout = std::env::var("first_token_timeout").ok();
        self.first_token_max_retries = std::env::var("first_token_max_retries").ok();
        self.streaming_read_timeout = std::env::var("streaming_read_timeout").ok();
        self.callback_port_start = std::env::var("oauth.callback_port_start").ok();
        self.callback_port_end = std::env::var("oauth.callback_port_end").ok();
        self.oauth_auth_timeout = std::env::var("oauth.auth_timeout").ok();
        self.oauth_poll_interval = std::env::var("oauth.poll_interval").ok();
        self
    }

    /// Validate and finalize into a [`GatewayConfig`], or fail eagerly with
    /// a [`Error::Config`] describing the first bad value found.
    pub fn build(self) -> Result<GatewayConfig> {
        let region = self.region.unwrap_or_else(|| DEFAULT_REGION.to_string());

        let auth_mode = match self.auth_mode {
            Some(raw) => raw.parse().map_err(|_| {
                Error::Config(format!("AUTH_MODE must be pool|single|per_request, got {:?}", raw))
            })?,
            None => AuthMode::Single,
        };

        let storage = match self.database_url {
            Some(url) => StorageBackend::Sqlite(url),
            None => StorageBackend::File,
        };

        let first_token_timeout = parse_secs(self.first_token_timeout, "first_token_timeout", FIRST_TOKEN_TIMEOUT)?;
        let first_token_max_retries = match self.first_token_max_retries {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("first_token_max_retries must be an integer, got {:?}", raw)))?,
            None => MAX_RETRIES,
        };
        let streaming_read_timeout =
            parse_secs(self.streaming_read_timeout, "streaming_read_timeout", STREAMING_READ_TIMEOUT)?;

        if streaming_read_timeout <= first_token_timeout {
            return Err(Error::Config(format!(
                "streaming_read_timeout ({:?}) must exceed first_token_timeout ({:?})",
                streaming_read_timeout, first_token_timeout
            )));
        }

        let port_start = match self.callback_port_start {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("oauth.callback_port_start must be a port number, got {:?}", raw)))?,
            None => DEFAULT_CALLBACK_PORT_RANGE.0,
        };
        let port_end = match self.callback_port_end {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("oauth.callback_port_end must be a port number, got {:?}", raw)))?,
            None => DEFAULT_CALLBACK_PORT_RANGE.1,
        };
        if port_start > port_end {
            return Err(Error::Config(format!(
                "oauth.callback_port_start ({port_start}) must not exceed oauth.callback_port_end ({port_end})"
            )));
        }

        let oauth_auth_timeout = parse_secs(self.oauth_auth_timeout, "oauth.auth_timeout", DEFAULT_AUTH_TIMEOUT)?;
        let oauth_poll_interval =
            parse_secs(self.oauth_poll_interval, "oauth.poll_interval", DEFAULT_POLL_INTERVAL)?;

        Ok(GatewayConfig {
            region,
            auth_mode,
            storage,
            refresh_token: self.refresh_token,
            profile_arn: self.profile_arn,
            credentials_file: self.credentials_file,
            first_token_timeout,
            first_token_max_retries,
            streaming_read_timeout,
            callback_port_range: (port_start, port_end),
            oauth_auth_timeout,
            oauth_poll_interval,
        })
    }
}

fn parse_secs(raw: Option<String>, key: &str, default: Duration) -> Result<Duration> {
    match raw {
        Some(raw) => {
            let secs: u64 = raw
                .parse()
                .map_err(|_| Error::Config(format!("{key} must be an integer number of seconds, got {:?}", raw)))?;
            Ok(Duration::from_secs(secs))
        }
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_no_environment() {
        let config = GatewayConfigBuilder::new().build().unwrap();
        assert_eq!(config.region, DEFAULT_REGION);
        assert_eq!(config.auth_mode, AuthMode::Single);
        assert_eq!(config.storage, StorageBackend::File);
        assert_eq!(config.callback_port_range, DEFAULT_CALLBACK_PORT_RANGE);
    }

    #[test]
    fn database_url_selects_sqlite_backend() {
        let mut builder = GatewayConfigBuilder::new();
        builder.database_url = Some("sqlite:///tmp/x.db".to_string());
        let config = builder.build().unwrap();
        assert_eq!(config.storage, StorageBackend::Sqlite("sqlite:///tmp/x.db".to_string()));
    }

    #[test]
    fn invalid_auth_mode_is_rejected_eagerly() {
        let mut builder = GatewayConfigBuilder::new();
        builder.auth_mode = Some("bogus".to_string());
        assert!(builder.build().is_err());
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let mut builder = GatewayConfigBuilder::new();
        builder.callback_port_start = Some("9000".to_string());
        builder.callback_port_end = Some("8000".to_string());
        assert!(builder.build().is_err());
    }

    #[test]
    fn streaming_timeout_must_exceed_first_token_timeout() {
        let mut builder = GatewayConfigBuilder::new();
        builder.first_token_timeout = Some("30".to_string());
        builder.streaming_read_timeout = Some("30".to_string());
        assert!(builder.build().is_err());
    }
}
