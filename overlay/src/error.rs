//! Shared error taxonomy (see the error handling design notes).
//!
//! Every fallible call in this crate returns `Result<T, OverlayError>` (or a
//! component-local error convertible into it via `From`). Start-up
//! validation failures are the one place that still uses `anyhow::Context`
//! and a direct process exit, per the single-exit-path rule.

use std::fmt;

/// Broad category of failure, mirroring the error handling design's taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Identity,
    Authorization,
    Resource,
    NetworkTransient,
    NetworkPermanent,
    Pairing,
    Vault,
    Protocol,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Identity => "identity",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Resource => "resource",
            ErrorKind::NetworkTransient => "network-transient",
            ErrorKind::NetworkPermanent => "network-permanent",
            ErrorKind::Pairing => "pairing",
            ErrorKind::Vault => "vault",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A single error value carrying a kind and a human-readable message.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OverlayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl OverlayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn identity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Identity, message)
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn network_transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkTransient, message)
    }

    pub fn network_permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkPermanent, message)
    }

    /// Pairing errors must collapse every handshake failure to one message;
    /// callers should always construct this with the literal invalid-code
    /// text, never with the underlying cause, to avoid a distinguishing
    /// oracle between "wrong token" and "transport fault".
    pub fn pairing_invalid_code() -> Self {
        Self::new(ErrorKind::Pairing, "invalid invite code")
    }

    pub fn pairing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Pairing, message)
    }

    pub fn vault(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Vault, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// HTTP status used by both the local control API and the relay admin
    /// protocol's JSON envelopes.
    pub fn status_code(&self) -> u16 {
        match self.kind {
            ErrorKind::Configuration => 400,
            ErrorKind::Identity => 500,
            ErrorKind::Authorization => 401,
            ErrorKind::Resource => 400,
            ErrorKind::NetworkTransient => 502,
            ErrorKind::NetworkPermanent => 502,
            ErrorKind::Pairing => 400,
            ErrorKind::Vault => 400,
            ErrorKind::Protocol => 400,
            ErrorKind::Internal => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, OverlayError>;
