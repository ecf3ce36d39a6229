//! Data models for the Kiro gateway.

pub mod account;
pub mod auth;
pub mod kiro;
