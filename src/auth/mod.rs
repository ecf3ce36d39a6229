//! Upstream OAuth refresh protocols and machine identification.

pub mod aws_sso_oidc;
pub mod constants;
pub mod kiro_desktop;
