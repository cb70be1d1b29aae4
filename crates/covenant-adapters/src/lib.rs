//! Signature provider gateway for Covenant.
//!
//! Implements [`covenant_core::SignatureProvider`] against a hosted
//! e-signature REST API. Status payloads are normalized into
//! [`covenant_core::EnvelopeStatusReport`] here, so the engine never sees the
//! provider's wire shapes.

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod payload;

pub use auth::ProviderTokenSource;
pub use config::HttpProviderConfig;
pub use error::GatewayError;
pub use http::HttpSignatureProvider;
