//! # kiro-gateway
//!
//! Gateway core for exposing Amazon CodeWhisperer ("Kiro") as a chat-completions
//! backend: multi-account credential lifecycle, request-time account
//! selection, and the upstream streaming proxy.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kiro_gateway::{AccountPool, CredentialStore, Result};
//! use kiro_gateway::store::FileCredentialStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let store: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::open("~/.kiro/accounts.json")?);
//!     let pool = AccountPool::new(store);
//!     pool.load().await?;
//!
//!     if let Some(record) = pool.next().await {
//!         println!("selected account {}", record.id);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `sqlite` - Enable the relational (embedded SQL engine) credential store backend
//! - `full` - Enable all optional features

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway_config;
pub mod models;
pub mod oauth;
pub mod pool;
pub mod refresher;
pub mod resolver;
pub mod store;
pub mod transcoder;
pub mod transport;

// Re-exports for ergonomic usage
pub use error::{Error, Result};
pub use gateway_config::{GatewayConfig, GatewayConfigBuilder, StorageBackend};
pub use models::account::{AuthKind, CredentialRecord};
pub use models::kiro::KiroStreamEvent;
pub use oauth::OAuthAcquirer;
pub use pool::AccountPool;
pub use refresher::TokenRefresher;
pub use resolver::{AuthMode, AuthResolver};
pub use store::CredentialStore;
pub use transcoder::{DownstreamFrame, Transcoder, WatchdogConfig};
pub use transport::http::UpstreamClient;
pub use transport::sse::StreamScanner;
