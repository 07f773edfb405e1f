//! # TMI Security
//!
//! Envelope encryption for secrets at rest and HMAC-SHA256 signing for
//! webhook bodies. No policy lives here; callers decide what to encrypt
//! and what to sign.

pub mod secrets;
pub mod signature;

pub use secrets::{SecretError, SecretsManager};
pub use signature::{sign_body, signature_header, verify_signature};
